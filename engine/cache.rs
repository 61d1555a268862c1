//! Memoization of completed pipeline results, with single-flight collapse of
//! concurrent identical requests.
//!
//! The cache is the engine's only mutable shared structure. Three rules hold:
//!
//! 1. At most one computation runs per (fingerprint, model version) key;
//!    concurrent callers for the same key wait for it and share its outcome.
//! 2. Only successes are memoized. A failure reaches every waiter of that
//!    flight but leaves no trace behind, so a transient misconfiguration
//!    never poisons the cache.
//! 3. Eviction (bounded LRU) only ever touches completed entries. An
//!    in-flight key is pinned by living outside the LRU until it completes.

use crate::predict::EngineError;
use crate::reduce::PyramidResult;
use crate::types::{Fingerprint, ModelVersion, PredictionResult};
use ahash::AHashMap;
use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Cache key: one validated input under one model version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub fingerprint: Fingerprint,
    pub model_version: ModelVersion,
}

#[derive(Default)]
struct FlightState {
    outcome: Option<Result<Arc<PredictionResult>, EngineError>>,
}

/// One in-flight computation. The first claimant computes; everyone else
/// parks on the condvar until the outcome lands.
struct Flight {
    state: Mutex<FlightState>,
    done: Condvar,
}

enum Claim {
    Compute(Arc<Flight>),
    Wait(Arc<Flight>),
}

struct CacheInner {
    predictions: LruCache<CacheKey, Arc<PredictionResult>>,
    pyramids: LruCache<Fingerprint, Arc<PyramidResult>>,
    in_flight: AHashMap<CacheKey, Arc<Flight>>,
}

/// Bounded, least-recently-used result cache wrapped around the pure
/// pipeline stages.
pub struct ResultCache {
    inner: Mutex<CacheInner>,
}

impl ResultCache {
    /// `capacity` bounds each completed-entry store; in-flight computations
    /// are not counted against it.
    pub fn new(capacity: NonZeroUsize) -> Self {
        log::debug!("result cache initialized with capacity {capacity}");
        Self {
            inner: Mutex::new(CacheInner {
                predictions: LruCache::new(capacity),
                pyramids: LruCache::new(capacity),
                in_flight: AHashMap::new(),
            }),
        }
    }

    /// Returns the memoized result for `key`, or claims the key and runs
    /// `compute` exactly once across all concurrent callers.
    ///
    /// `compute` runs with no cache lock held and must not panic: a panicked
    /// flight is never cleared and its waiters would park forever. A caller
    /// abandoning its thread does not cancel a claimed computation; other
    /// waiters may still need it; timeouts belong to the caller, around this
    /// whole call.
    pub fn get_or_compute<F>(
        &self,
        key: CacheKey,
        compute: F,
    ) -> Result<Arc<PredictionResult>, EngineError>
    where
        F: FnOnce() -> Result<(Arc<PyramidResult>, Arc<PredictionResult>), EngineError>,
    {
        let claim = {
            let mut inner = self.inner.lock();
            if let Some(hit) = inner.predictions.get(&key) {
                let hit = Arc::clone(hit);
                // Keep the pyramid's recency aligned with its prediction.
                inner.pyramids.get(&key.fingerprint);
                log::debug!("cache hit for {}", key.fingerprint);
                return Ok(hit);
            }
            match inner.in_flight.get(&key) {
                Some(flight) => Claim::Wait(Arc::clone(flight)),
                None => {
                    let flight = Arc::new(Flight {
                        state: Mutex::new(FlightState::default()),
                        done: Condvar::new(),
                    });
                    inner.in_flight.insert(key, Arc::clone(&flight));
                    Claim::Compute(flight)
                }
            }
        };

        match claim {
            Claim::Wait(flight) => {
                let mut state = flight.state.lock();
                loop {
                    if let Some(outcome) = &state.outcome {
                        return outcome.clone();
                    }
                    flight.done.wait(&mut state);
                }
            }
            Claim::Compute(flight) => {
                log::debug!("cache miss for {}; computing", key.fingerprint);
                let outcome = match compute() {
                    Ok((pyramid, prediction)) => {
                        let mut inner = self.inner.lock();
                        inner.pyramids.put(key.fingerprint, pyramid);
                        inner.predictions.put(key, Arc::clone(&prediction));
                        inner.in_flight.remove(&key);
                        Ok(prediction)
                    }
                    Err(error) => {
                        let mut inner = self.inner.lock();
                        inner.in_flight.remove(&key);
                        Err(error)
                    }
                };
                let mut state = flight.state.lock();
                state.outcome = Some(outcome.clone());
                flight.done.notify_all();
                outcome
            }
        }
    }

    /// The retained reduction trace for a fingerprint, if still resident.
    pub fn pyramid(&self, fingerprint: &Fingerprint) -> Option<Arc<PyramidResult>> {
        self.inner.lock().pyramids.get(fingerprint).map(Arc::clone)
    }

    /// Number of completed prediction entries currently resident.
    pub fn len(&self) -> usize {
        self.inner.lock().predictions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reduce::{reduce, PyramidParams};
    use crate::registry::ModelNotFoundError;
    use crate::schema::FeatureVector;
    use crate::types::SchemaVersion;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn pyramid(values: &[f64]) -> Arc<PyramidResult> {
        let params = PyramidParams {
            block_size: 2,
            max_depth: 8,
            truth_coefficient: 1.0,
            normalization_range: 1000.0,
        };
        let input = FeatureVector::from_values(SchemaVersion::new("v1"), values.to_vec());
        Arc::new(reduce(&input, &params).unwrap())
    }

    fn prediction(fingerprint: Fingerprint) -> Arc<PredictionResult> {
        Arc::new(PredictionResult {
            categories: vec!["low".into(), "high".into()],
            probabilities: vec![0.7, 0.3],
            label: "low".into(),
            flagged: vec![],
            model_version: ModelVersion::new(1, 0, 0),
            fingerprint,
        })
    }

    fn key_for(values: &[f64]) -> (CacheKey, Arc<PyramidResult>) {
        let pyramid = pyramid(values);
        let key = CacheKey {
            fingerprint: pyramid.fingerprint(),
            model_version: ModelVersion::new(1, 0, 0),
        };
        (key, pyramid)
    }

    fn capacity(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn a_second_lookup_reuses_the_first_computation() {
        let cache = ResultCache::new(capacity(8));
        let (key, pyramid) = key_for(&[1.0, 2.0, 3.0]);
        let calls = AtomicUsize::new(0);

        let first = cache
            .get_or_compute(key, || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok((Arc::clone(&pyramid), prediction(key.fingerprint)))
            })
            .unwrap();
        let second = cache
            .get_or_compute(key, || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok((Arc::clone(&pyramid), prediction(key.fingerprint)))
            })
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn concurrent_callers_collapse_into_one_computation() {
        let cache = Arc::new(ResultCache::new(capacity(8)));
        let (key, pyramid) = key_for(&[5.0, 6.0, 7.0, 8.0]);
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let pyramid = Arc::clone(&pyramid);
                let calls = Arc::clone(&calls);
                thread::spawn(move || {
                    cache
                        .get_or_compute(key, || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            // Hold the flight open long enough for the other
                            // threads to pile onto it.
                            thread::sleep(Duration::from_millis(50));
                            Ok((pyramid, prediction(key.fingerprint)))
                        })
                        .unwrap()
                })
            })
            .collect();

        let results: Vec<Arc<PredictionResult>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in &results[1..] {
            assert!(Arc::ptr_eq(&results[0], result));
        }
    }

    #[test]
    fn errors_reach_waiters_but_are_never_memoized() {
        let cache = ResultCache::new(capacity(8));
        let (key, pyramid) = key_for(&[9.0, 10.0]);
        let calls = AtomicUsize::new(0);

        let failed: Result<_, EngineError> = cache.get_or_compute(key, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ModelNotFoundError::Empty.into())
        });
        assert!(failed.is_err());

        // The failure left nothing behind: the next call computes again.
        let recovered = cache
            .get_or_compute(key, || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok((Arc::clone(&pyramid), prediction(key.fingerprint)))
            })
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(recovered.fingerprint, key.fingerprint);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn least_recently_used_entries_are_evicted_first() {
        let cache = ResultCache::new(capacity(2));
        let (key_a, pyr_a) = key_for(&[1.0, 1.0]);
        let (key_b, pyr_b) = key_for(&[2.0, 2.0]);
        let (key_c, pyr_c) = key_for(&[3.0, 3.0]);

        cache
            .get_or_compute(key_a, || Ok((pyr_a, prediction(key_a.fingerprint))))
            .unwrap();
        cache
            .get_or_compute(key_b, || Ok((pyr_b, prediction(key_b.fingerprint))))
            .unwrap();

        // Touch A so B becomes the least recently used entry.
        let touched = AtomicUsize::new(0);
        cache
            .get_or_compute(key_a, || {
                touched.fetch_add(1, Ordering::SeqCst);
                unreachable!("key A is resident")
            })
            .unwrap();
        assert_eq!(touched.load(Ordering::SeqCst), 0);

        cache
            .get_or_compute(key_c, || Ok((pyr_c, prediction(key_c.fingerprint))))
            .unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.pyramid(&key_a.fingerprint).is_some());
        assert!(cache.pyramid(&key_b.fingerprint).is_none());
        assert!(cache.pyramid(&key_c.fingerprint).is_some());
    }

    #[test]
    fn explain_lookup_returns_the_stored_pyramid() {
        let cache = ResultCache::new(capacity(4));
        let (key, pyramid) = key_for(&[4.0, 8.0, 15.0, 16.0, 23.0, 42.0]);

        cache
            .get_or_compute(key, || {
                Ok((Arc::clone(&pyramid), prediction(key.fingerprint)))
            })
            .unwrap();

        let explained = cache.pyramid(&key.fingerprint).unwrap();
        assert_eq!(explained.levels().len(), 4);
        assert!(cache.pyramid(&key_for(&[0.0, 0.0]).0.fingerprint).is_none());
    }
}
