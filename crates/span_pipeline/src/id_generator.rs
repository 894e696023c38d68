//! Trace and span id generation.

use crate::span::{SpanId, TraceId};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::fmt;

/// Interface for generating ids.
pub trait IdGenerator: Send + Sync + fmt::Debug {
    /// Generates a new non-zero `TraceId`.
    fn new_trace_id(&self) -> TraceId;

    /// Generates a new non-zero `SpanId`.
    fn new_span_id(&self) -> SpanId;
}

/// Uniformly distributed random ids from a per-thread generator.
///
/// Each thread owns its `SmallRng`, seeded from OS entropy on first use, so
/// generation never contends on shared state.
#[derive(Clone, Debug, Default)]
pub struct RandomIdGenerator {
    _private: (),
}

impl RandomIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

thread_local! {
    static CURRENT_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_entropy());
}

impl IdGenerator for RandomIdGenerator {
    fn new_trace_id(&self) -> TraceId {
        CURRENT_RNG.with(|rng| {
            let mut rng = rng.borrow_mut();
            loop {
                let id = rng.gen::<u128>();
                if id != 0 {
                    return TraceId::from_u128(id);
                }
            }
        })
    }

    fn new_span_id(&self) -> SpanId {
        CURRENT_RNG.with(|rng| {
            let mut rng = rng.borrow_mut();
            loop {
                let id = rng.gen::<u64>();
                if id != 0 {
                    return SpanId::from_u64(id);
                }
            }
        })
    }
}
