use crate::common::data::{Body, HttpRequest, KeyToMultiValue};
use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot evaluate request matcher: {0}")]
    EvaluationError(String),
}

/// Decides whether a concrete request satisfies a request matcher.
///
/// Fields that are not set on the matcher are not checked.
pub trait RequestMatcher: Send + Sync {
    fn matches(&self, matcher: &HttpRequest, request: &HttpRequest) -> Result<bool, Error>;
}

/// Default matcher: every populated field must match. String values match when they are equal
/// or when the matcher value, read as a regular expression, matches the whole value.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpRequestMatcher;

impl RequestMatcher for HttpRequestMatcher {
    fn matches(&self, matcher: &HttpRequest, request: &HttpRequest) -> Result<bool, Error> {
        tracing::trace!("Matching request against request matcher");

        let method_matches = match (&matcher.method, &request.method) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(expected), Some(actual)) => {
                expected.eq_ignore_ascii_case(actual) || string_matches(expected, actual)
            }
        };

        let path_matches = match (&matcher.path, &request.path) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(expected), Some(actual)) => string_matches(expected, actual),
        };

        Ok(method_matches
            && path_matches
            && multi_values_match(
                &matcher.query_string_parameters,
                &request.query_string_parameters,
                false,
            )
            && multi_values_match(&matcher.headers, &request.headers, true)
            && body_matches(matcher.body.as_ref(), request.body.as_ref()))
    }
}

fn string_matches(expected: &str, actual: &str) -> bool {
    if expected == actual {
        return true;
    }

    match Regex::new(&format!("^(?:{})$", expected)) {
        Ok(re) => re.is_match(actual),
        Err(_) => false,
    }
}

/// Every expected value of every expected name must match at least one actual value.
fn multi_values_match(
    expected: &KeyToMultiValue,
    actual: &KeyToMultiValue,
    ignore_name_case: bool,
) -> bool {
    expected.iter().all(|(name, expected_values)| {
        let actual_values = if ignore_name_case {
            actual.get_ignore_case(name)
        } else {
            actual.get(name)
        };

        match actual_values {
            None => false,
            Some(actual_values) => expected_values.iter().all(|expected_value| {
                actual_values
                    .iter()
                    .any(|actual_value| string_matches(expected_value, actual_value))
            }),
        }
    })
}

fn body_matches(expected: Option<&Body>, actual: Option<&Body>) -> bool {
    match (expected, actual) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(Body::Json(expected)), Some(actual)) => match actual {
            Body::Json(actual) => expected == actual,
            other => serde_json::from_slice::<serde_json::Value>(&other.to_bytes())
                .map(|actual| *expected == actual)
                .unwrap_or(false),
        },
        (Some(Body::Binary(expected)), Some(actual)) => *expected == actual.to_bytes(),
        (Some(Body::String(expected)), Some(actual)) => {
            string_matches(expected, &actual.as_string())
        }
    }
}

#[cfg(test)]
mod test {
    use crate::{
        common::data::{Body, HttpRequest},
        server::matchers::{HttpRequestMatcher, RequestMatcher},
    };

    fn matches(matcher: &HttpRequest, request: &HttpRequest) -> bool {
        HttpRequestMatcher.matches(matcher, request).unwrap()
    }

    /// An empty matcher does not care about any field.
    #[test]
    fn empty_matcher_matches_everything() {
        let request = HttpRequest::request()
            .with_method("POST")
            .with_path("/any")
            .with_body("x");
        assert!(matches(&HttpRequest::request(), &request));
    }

    #[test]
    fn path_exact_and_regex() {
        // Arrange
        let request = HttpRequest::request().with_path("/orders/42");

        // Assert
        assert!(matches(&HttpRequest::request().with_path("/orders/42"), &request));
        assert!(matches(&HttpRequest::request().with_path("/orders/\\d+"), &request));
        assert!(!matches(&HttpRequest::request().with_path("/orders"), &request));
        assert!(!matches(
            &HttpRequest::request().with_path("/orders/42"),
            &HttpRequest::request()
        ));
    }

    #[test]
    fn method_is_case_insensitive() {
        let request = HttpRequest::request().with_method("GET");
        assert!(matches(&HttpRequest::request().with_method("get"), &request));
        assert!(!matches(&HttpRequest::request().with_method("PUT"), &request));
    }

    #[test]
    fn header_names_are_case_insensitive() {
        // Arrange
        let request = HttpRequest::request()
            .with_header("Content-Type", "application/json")
            .with_header("X-Trace", "abc");

        // Assert
        assert!(matches(
            &HttpRequest::request().with_header("content-type", "application/json"),
            &request
        ));
        assert!(!matches(
            &HttpRequest::request().with_header("x-missing", "abc"),
            &request
        ));
    }

    #[test]
    fn query_parameters_are_multi_valued_and_order_irrelevant() {
        // Arrange
        let request = HttpRequest::request()
            .with_query_string_parameter("id", "2")
            .with_query_string_parameter("id", "1");

        // Assert
        assert!(matches(
            &HttpRequest::request()
                .with_query_string_parameter("id", "1")
                .with_query_string_parameter("id", "2"),
            &request
        ));
        assert!(!matches(
            &HttpRequest::request().with_query_string_parameter("id", "3"),
            &request
        ));
    }

    #[test]
    fn json_body_compares_structurally() {
        // Arrange
        let matcher =
            HttpRequest::request().with_body(Body::Json(serde_json::json!({ "a": 1, "b": 2 })));
        let request = HttpRequest::request().with_body(r#"{ "b" : 2, "a" : 1 }"#);

        // Assert
        assert!(matches(&matcher, &request));
        assert!(!matches(&matcher, &HttpRequest::request().with_body("not json")));
    }
}
