use crate::{
    common::{
        data::Expectation,
        serialization::{self, deserialize_expectations},
    },
    server::state::{self, StateManager},
};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot read initialization file {0}: {1}")]
    FileReadError(PathBuf, std::io::Error),
    #[error("cannot deserialize initialization file: {0}")]
    DeserializationError(#[from] serialization::Error),
    #[error("cannot modify state: {0}")]
    StateError(#[from] state::Error),
}

/// Reads one expectation or an array of expectations from a JSON file.
pub fn read_initialization_file(path: &Path) -> Result<Vec<Expectation>, Error> {
    tracing::info!(
        "Loading expectations from initialization file '{}'",
        path.to_string_lossy()
    );

    let content = std::fs::read(path).map_err(|err| Error::FileReadError(path.to_path_buf(), err))?;
    Ok(deserialize_expectations(&content)?)
}

/// Adds the expectations of an initialization file to the state. Returns how many were added.
pub fn load_initialization_file<S>(path: &Path, state: &S) -> Result<usize, Error>
where
    S: StateManager,
{
    let expectations = read_initialization_file(path)?;
    let count = expectations.len();
    state.add(expectations)?;
    Ok(count)
}

#[cfg(test)]
mod test {
    use crate::server::{
        persistence::{load_initialization_file, read_initialization_file, Error},
        state::{HttpState, StateManager},
    };
    use crate::common::data::HttpRequest;
    use std::path::PathBuf;

    fn temp_file(content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("mockserver-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn loads_expectation_array() {
        // Arrange
        let path = temp_file(
            r#"[
                { "httpRequest" : { "path" : "/a" }, "httpResponse" : { "body" : "a" } },
                { "httpRequest" : { "path" : "/b" }, "httpResponse" : { "statusCode" : 202 } }
            ]"#,
        );
        let state = HttpState::default();

        // Act
        let count = load_initialization_file(&path, &state).unwrap();

        // Assert
        assert_eq!(count, 2);
        let matched = state
            .first_matching_expectation(&HttpRequest::request().with_path("/b"))
            .unwrap();
        assert!(matched.is_some());
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn reports_missing_and_malformed_files() {
        let missing = std::env::temp_dir().join("mockserver-does-not-exist.json");
        assert!(matches!(
            read_initialization_file(&missing),
            Err(Error::FileReadError(_, _))
        ));

        let malformed = temp_file("{ nope");
        assert!(matches!(
            read_initialization_file(&malformed),
            Err(Error::DeserializationError(_))
        ));
        std::fs::remove_file(malformed).unwrap();
    }
}
