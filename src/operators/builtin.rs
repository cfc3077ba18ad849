//! The stock operators named in §4.9: `Map`, `Filter`, `KeyBy`, `Reduce`, and
//! a `Sink` for terminal side effects. Grounded on
//! `harborgrid-justin-rusty-db`'s `FilterOperator`/`event_processing::operators`
//! shape (closure-bearing struct implementing a `process` method), adapted
//! to the two-type-parameter [`super::Operator`] trait this runtime uses.

use std::collections::HashMap;
use std::hash::Hash;

use crate::error::Result;
use crate::operators::Operator;

pub struct Map<T, U, F>
where
    F: FnMut(T) -> U + Send,
{
    f: F,
    _marker: std::marker::PhantomData<fn(T) -> U>,
}

impl<T, U, F> Map<T, U, F>
where
    F: FnMut(T) -> U + Send,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T, U, F> Operator<T, U> for Map<T, U, F>
where
    T: Send,
    U: Send,
    F: FnMut(T) -> U + Send,
{
    fn process(&mut self, input: T) -> Result<Vec<U>> {
        Ok(vec![(self.f)(input)])
    }
}

pub struct Filter<T, F>
where
    F: FnMut(&T) -> bool + Send,
{
    predicate: F,
    passed: u64,
    filtered: u64,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T, F> Filter<T, F>
where
    F: FnMut(&T) -> bool + Send,
{
    pub fn new(predicate: F) -> Self {
        Self {
            predicate,
            passed: 0,
            filtered: 0,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn stats(&self) -> (u64, u64) {
        (self.passed, self.filtered)
    }
}

impl<T, F> Operator<T, T> for Filter<T, F>
where
    T: Send,
    F: FnMut(&T) -> bool + Send,
{
    fn process(&mut self, input: T) -> Result<Vec<T>> {
        if (self.predicate)(&input) {
            self.passed += 1;
            Ok(vec![input])
        } else {
            self.filtered += 1;
            Ok(vec![])
        }
    }
}

pub struct KeyBy<T, K, F>
where
    F: FnMut(&T) -> K + Send,
{
    key_fn: F,
    _marker: std::marker::PhantomData<fn(T) -> K>,
}

impl<T, K, F> KeyBy<T, K, F>
where
    F: FnMut(&T) -> K + Send,
{
    pub fn new(key_fn: F) -> Self {
        Self {
            key_fn,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T, K, F> Operator<T, (K, T)> for KeyBy<T, K, F>
where
    T: Send,
    K: Send,
    F: FnMut(&T) -> K + Send,
{
    fn process(&mut self, input: T) -> Result<Vec<(K, T)>> {
        let key = (self.key_fn)(&input);
        Ok(vec![(key, input)])
    }
}

/// Reduces keyed input `(K, T)` with `r: (T, T) -> T`, keeping one
/// accumulator per key. Emits the updated accumulator on every input, so
/// downstream always sees the latest fold result for that key.
pub struct Reduce<K, T, F>
where
    K: Eq + Hash + Clone + Send,
    F: FnMut(T, T) -> T + Send,
{
    reducer: F,
    accumulators: HashMap<K, T>,
}

impl<K, T, F> Reduce<K, T, F>
where
    K: Eq + Hash + Clone + Send,
    F: FnMut(T, T) -> T + Send,
{
    pub fn new(reducer: F) -> Self {
        Self {
            reducer,
            accumulators: HashMap::new(),
        }
    }
}

impl<K, T, F> Operator<(K, T), (K, T)> for Reduce<K, T, F>
where
    K: Eq + Hash + Clone + Send,
    T: Clone + Send,
    F: FnMut(T, T) -> T + Send,
{
    fn process(&mut self, input: (K, T)) -> Result<Vec<(K, T)>> {
        let (key, value) = input;
        let updated = match self.accumulators.remove(&key) {
            Some(acc) => (self.reducer)(acc, value),
            None => value,
        };
        self.accumulators.insert(key.clone(), updated.clone());
        Ok(vec![(key, updated)])
    }

    fn snapshot_state(&self) -> serde_json::Value {
        serde_json::json!({ "key_count": self.accumulators.len() })
    }
}

/// Terminal side-effecting stage. `U = ()` because nothing consumes its
/// output; a [`super::PipelineBuilder`] drops whatever the last stage
/// returns.
pub struct Sink<T, F>
where
    F: FnMut(T) -> Result<()> + Send,
{
    effect: F,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T, F> Sink<T, F>
where
    F: FnMut(T) -> Result<()> + Send,
{
    pub fn new(effect: F) -> Self {
        Self {
            effect,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T, F> Operator<T, ()> for Sink<T, F>
where
    T: Send,
    F: FnMut(T) -> Result<()> + Send,
{
    fn process(&mut self, input: T) -> Result<Vec<()>> {
        (self.effect)(input)?;
        Ok(vec![])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::PipelineBuilder;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn map_filter_reduce_chain_accumulates_per_key() {
        let total = Arc::new(AtomicI32::new(0));
        let total2 = total.clone();
        let (builder, inlet) = PipelineBuilder::<i32>::new(8);
        let pipeline = builder
            .then("key_by_parity", KeyBy::new(|x: &i32| x % 2))
            .then("sum_per_key", Reduce::new(|a: i32, b: i32| a + b))
            .then(
                "collect",
                Sink::new(move |(_k, v): (i32, i32)| {
                    total2.store(v, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .finish();

        for i in [0, 2, 4] {
            inlet.elements.send(i).await.unwrap();
        }
        drop(inlet);
        pipeline.join().await;
        assert_eq!(total.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn filter_drops_non_matching_elements() {
        let seen = Arc::new(AtomicI32::new(0));
        let seen2 = seen.clone();
        let (builder, inlet) = PipelineBuilder::<i32>::new(8);
        let pipeline = builder
            .then("evens_only", Filter::new(|x: &i32| x % 2 == 0))
            .then(
                "count",
                Sink::new(move |_x: i32| {
                    seen2.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .finish();

        for i in 0..5 {
            inlet.elements.send(i).await.unwrap();
        }
        drop(inlet);
        pipeline.join().await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}
