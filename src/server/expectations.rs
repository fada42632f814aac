use crate::{
    common::{
        data::{Expectation, HttpRequest, Times},
        util::Clock,
    },
    server::{
        log::{self, ActivityLog, LogArgument, LogEntry, LogMessageType},
        matchers::{self, RequestMatcher},
    },
};
use std::{
    cmp::Reverse,
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot evaluate expectation matcher: {0}")]
    MatcherError(#[from] matchers::Error),
    #[error("cannot access activity log: {0}")]
    LogError(#[from] log::Error),
}

/// Position of an expectation in matching order: higher priority first, then most recently added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct MatchingKey {
    priority: Reverse<i32>,
    sequence: Reverse<u64>,
}

#[derive(Default)]
struct ExpectationSet {
    by_matching_order: BTreeMap<MatchingKey, Expectation>,
    keys_by_id: HashMap<String, MatchingKey>,
    next_sequence: u64,
}

impl ExpectationSet {
    fn remove_key(&mut self, key: &MatchingKey) -> Option<Expectation> {
        let removed = self.by_matching_order.remove(key)?;
        if let Some(id) = &removed.id {
            self.keys_by_id.remove(id);
        }
        Some(removed)
    }

    fn oldest_key(&self) -> Option<MatchingKey> {
        self.by_matching_order
            .keys()
            .max_by_key(|key| key.sequence)
            .copied()
    }
}

/// Priority ordered collection of expectations with unique ids.
///
/// All operations take a single lock, so readers never observe a partially applied add or clear.
pub struct ExpectationStore {
    state: Mutex<ExpectationSet>,
    log: Arc<ActivityLog>,
    matcher: Arc<dyn RequestMatcher>,
    clock: Arc<dyn Clock>,
    max_expectations: usize,
}

impl ExpectationStore {
    pub fn new(
        log: Arc<ActivityLog>,
        matcher: Arc<dyn RequestMatcher>,
        clock: Arc<dyn Clock>,
        max_expectations: usize,
    ) -> Self {
        Self {
            state: Mutex::new(ExpectationSet::default()),
            log,
            matcher,
            clock,
            max_expectations,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ExpectationSet> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores an expectation and returns its stored form. An expectation with the id of an
    /// existing one replaces it.
    pub fn add(&self, expectation: Expectation) -> Expectation {
        let mut expectation = expectation;
        let id = expectation
            .id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();
        expectation.time_to_live = expectation.time_to_live.anchored_at(self.clock.now());

        let (updated, evicted) = {
            let mut state = self.lock();

            let updated = match state.keys_by_id.get(&id).copied() {
                Some(key) => state.remove_key(&key).is_some(),
                None => false,
            };

            let key = MatchingKey {
                priority: Reverse(expectation.priority),
                sequence: Reverse(state.next_sequence),
            };
            state.next_sequence += 1;
            state.keys_by_id.insert(id.clone(), key);
            state.by_matching_order.insert(key, expectation.clone());

            let mut evicted = Vec::new();
            while state.by_matching_order.len() > self.max_expectations {
                match state.oldest_key() {
                    Some(oldest) => evicted.extend(state.remove_key(&oldest)),
                    None => break,
                }
            }

            (updated, evicted)
        };

        for expectation in evicted {
            tracing::warn!(
                "Expectation limit of {} reached, removed oldest expectation {:?}",
                self.max_expectations,
                expectation.id
            );
        }

        tracing::debug!("Stored expectation with id={}", id);
        let format = if updated {
            "updated expectation:{}"
        } else {
            "creating expectation:{}"
        };
        self.log.append(
            LogEntry::new(LogMessageType::CreatedExpectation)
                .with_http_request(expectation.http_request.clone())
                .with_expectation(expectation.clone())
                .with_message(format, vec![LogArgument::Expectation(expectation.clone())]),
        );

        expectation
    }

    /// Finds the first active expectation in matching order that matches the request and
    /// consumes one of its remaining invocations. The expectation is returned as it was when
    /// it matched.
    pub fn first_matching(&self, request: &HttpRequest) -> Result<Option<Expectation>, Error> {
        let now = self.clock.now();
        let mut state = self.lock();

        for expectation in state.by_matching_order.values_mut() {
            if !expectation.is_active(now) {
                continue;
            }
            if self.matcher.matches(&expectation.http_request, request)? {
                let matched = expectation.clone();
                expectation.times.decrement();
                return Ok(Some(matched));
            }
        }

        Ok(None)
    }

    /// All stored expectations whose matcher matches the filter, in matching order. Inert
    /// expectations are listed until they are cleared.
    pub fn retrieve_active(&self, filter: Option<&HttpRequest>) -> Result<Vec<Expectation>, Error> {
        let snapshot: Vec<Expectation> = self.lock().by_matching_order.values().cloned().collect();

        match filter {
            None => Ok(snapshot),
            Some(filter) => {
                let mut result = Vec::with_capacity(snapshot.len());
                for expectation in snapshot {
                    if self.matcher.matches(filter, &expectation.http_request)? {
                        result.push(expectation);
                    }
                }
                Ok(result)
            }
        }
    }

    /// Removes matching expectations and the log entries of matching requests. The store stays
    /// locked until both are removed, so no expectation can be added or matched in between.
    pub fn clear(&self, filter: Option<&HttpRequest>) -> Result<Vec<Expectation>, Error> {
        let mut state = self.lock();
        let keys = self.matching_keys(&state, filter)?;
        self.log.clear(filter)?;
        Ok(Self::remove_keys(&mut state, &keys))
    }

    /// Removes matching expectations only. Returns the removed expectations.
    pub fn clear_expectations(
        &self,
        filter: Option<&HttpRequest>,
    ) -> Result<Vec<Expectation>, Error> {
        let mut state = self.lock();
        let keys = self.matching_keys(&state, filter)?;
        Ok(Self::remove_keys(&mut state, &keys))
    }

    fn matching_keys(
        &self,
        state: &ExpectationSet,
        filter: Option<&HttpRequest>,
    ) -> Result<Vec<MatchingKey>, Error> {
        let mut keys = Vec::new();
        for (key, expectation) in state.by_matching_order.iter() {
            let matches = match filter {
                Some(filter) => self.matcher.matches(filter, &expectation.http_request)?,
                None => true,
            };
            if matches {
                keys.push(*key);
            }
        }
        Ok(keys)
    }

    fn remove_keys(state: &mut ExpectationSet, keys: &[MatchingKey]) -> Vec<Expectation> {
        let removed: Vec<Expectation> = keys
            .iter()
            .filter_map(|key| state.remove_key(key))
            .collect();
        tracing::debug!("Removed {} expectation(s)", removed.len());
        removed
    }

    /// Expectations recorded from forwarded requests whose request matches the filter.
    pub fn retrieve_recorded(
        &self,
        filter: Option<&HttpRequest>,
    ) -> Result<Vec<Expectation>, Error> {
        let entries = self
            .log
            .retrieve_messages(filter, &[LogMessageType::ForwardedRequest])?;

        Ok(entries
            .into_iter()
            .filter_map(|entry| match (entry.expectation, entry.http_request) {
                (Some(expectation), _) => Some(expectation),
                (None, Some(request)) => entry.http_response.map(|response| {
                    Expectation::new(request)
                        .with_times(Times::once())
                        .then_respond(response)
                }),
                (None, None) => None,
            })
            .collect())
    }

    pub fn reset(&self) {
        let mut state = self.lock();
        state.by_matching_order.clear();
        state.keys_by_id.clear();
        self.log.reset();
    }

    pub fn len(&self) -> usize {
        self.lock().by_matching_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
