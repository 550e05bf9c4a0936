//! The host bridge (§4.11, §6): external-function invocation and the two
//! chance callbacks the choice/choose state machine consults. These are the
//! VM's named interfaces to collaborators this crate does not implement in
//! depth — a reflection-based auto-binder is explicitly out of scope; hosts
//! either implement `FunctionRegistry` themselves or populate a `MapRegistry`.

use core::cell::RefCell;

use alloc::rc::Rc;
use hashbrown::HashMap;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::error::VmError;
use crate::value::Value;
use crate::{Box, String, Vec};

/// External-function invocation, consumed by the `CallExternal` opcode.
pub trait FunctionRegistry {
    fn invoke(&mut self, name: &str, args: &[Value]) -> Result<Value, VmError>;
}

type HostFn = Box<dyn FnMut(&[Value]) -> Result<Value, VmError>>;

/// A plain `name -> closure` map for hosts that don't want to write a full
/// `FunctionRegistry` impl by hand. This is *not* the reflection/attribute
/// auto-binder the purpose statement excludes (§1) — callers register
/// functions explicitly by name.
#[derive(Default)]
pub struct MapRegistry {
    functions: HashMap<String, HostFn>,
}

impl MapRegistry {
    pub fn new() -> MapRegistry {
        MapRegistry { functions: HashMap::new() }
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        f: impl FnMut(&[Value]) -> Result<Value, VmError> + 'static,
    ) {
        self.functions.insert(name.into(), Box::new(f));
    }
}

impl FunctionRegistry for MapRegistry {
    fn invoke(&mut self, name: &str, args: &[Value]) -> Result<Value, VmError> {
        match self.functions.get_mut(name) {
            Some(f) => f(args),
            None => Err(VmError::lookup(crate::error::LookupKind::ExternalFunction, name)),
        }
    }
}

/// Decides whether a `ChoiceAdd`/`ChooseAdd` chance predicate passes.
pub trait ChanceCallback {
    fn chance(&mut self, p: f64) -> bool;
}

/// Picks an index among a set of choose weights.
pub trait WeightedCallback {
    fn weighted(&mut self, weights: &[f64]) -> i32;
}

/// The default chance/weighted callbacks, backed by a single VM-owned
/// seedable RNG (§9) — never constructed fresh per call, so a VM seeded
/// deterministically reproduces the exact same sequence of decisions across
/// runs, which is what makes the scenario tests in §8 reproducible.
pub struct DefaultRandom {
    rng: SmallRng,
}

impl DefaultRandom {
    pub fn new(seed: u64) -> DefaultRandom {
        DefaultRandom { rng: SmallRng::seed_from_u64(seed) }
    }

    /// Seeds from an unpredictable source. Only meaningful with `std`, since
    /// `no_std` has no entropy source of its own; falls back to a fixed seed
    /// otherwise (deterministic, but at least doesn't fail to build).
    pub fn from_entropy() -> DefaultRandom {
        #[cfg(feature = "std")]
        {
            DefaultRandom { rng: SmallRng::from_entropy() }
        }
        #[cfg(not(feature = "std"))]
        {
            DefaultRandom::new(0x5EED)
        }
    }
}

impl ChanceCallback for DefaultRandom {
    /// `d == 1 ∨ uniform(0,1) < d` (§6): `1.0` always passes, short-circuiting
    /// the RNG draw so authoring a guaranteed branch never consumes entropy.
    fn chance(&mut self, p: f64) -> bool {
        p >= 1.0 || self.rng.gen_range(0.0..1.0) < p
    }
}

impl WeightedCallback for DefaultRandom {
    /// Draws `uniform(0, sum_of_weights)` and selects by cumulative
    /// threshold (§9) — not a sample scaled by `sum - 1`, which would bias
    /// the resulting probabilities away from the authored weights.
    fn weighted(&mut self, weights: &[f64]) -> i32 {
        let sum: f64 = weights.iter().sum();
        if sum <= 0.0 || weights.is_empty() {
            return -1;
        }
        let mut threshold = self.rng.gen_range(0.0..sum);
        for (i, w) in weights.iter().enumerate() {
            if threshold < *w {
                return i as i32;
            }
            threshold -= w;
        }
        (weights.len() - 1) as i32
    }
}

/// Adapts a shared `DefaultRandom` so the VM's chance and weighted callbacks
/// can be two independent trait objects that nonetheless draw from the same
/// RNG stream (§9: one seedable RNG, not one per callback).
#[derive(Clone)]
pub struct SharedRandom(pub Rc<RefCell<DefaultRandom>>);

impl SharedRandom {
    pub fn new(seed: u64) -> SharedRandom {
        SharedRandom(Rc::new(RefCell::new(DefaultRandom::new(seed))))
    }
}

impl ChanceCallback for SharedRandom {
    fn chance(&mut self, p: f64) -> bool {
        self.0.borrow_mut().chance(p)
    }
}

impl WeightedCallback for SharedRandom {
    fn weighted(&mut self, weights: &[f64]) -> i32 {
        self.0.borrow_mut().weighted(weights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vec;

    #[test]
    fn chance_one_always_passes_without_consuming_rng() {
        let mut r = DefaultRandom::new(1);
        for _ in 0..100 {
            assert!(r.chance(1.0));
        }
    }

    #[test]
    fn weighted_picks_in_range() {
        let mut r = DefaultRandom::new(42);
        let weights = vec![1.0, 3.0, 0.0];
        for _ in 0..50 {
            let idx = r.weighted(&weights);
            assert!((0..3).contains(&idx));
        }
    }

    #[test]
    fn map_registry_invokes_registered_function() {
        let mut reg = MapRegistry::new();
        reg.register("double", |args: &[Value]| match args {
            [Value::Int(n)] => Ok(Value::Int(n * 2)),
            _ => Err(VmError::Host("expected one int arg".into())),
        });
        let result = reg.invoke("double", &[Value::Int(21)]).unwrap();
        assert!(matches!(result, Value::Int(42)));
    }

    #[test]
    fn map_registry_unknown_name_errors() {
        let mut reg = MapRegistry::new();
        assert!(reg.invoke("missing", &[]).is_err());
    }
}
