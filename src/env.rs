//! Env module: the runtime environment of named global slots.
//!
//! Copies made with [`RuntimeEnvironment::make_copy`] share one value table.
//! Each copy hands out its own accessor objects. Once any copy is made for
//! parallel execution the whole family is marked parallel and previously
//! registered slots become read-only.

use crate::datetime::{TimeZoneDatabase, TIME_ZONE_DB_SLOT};
use crate::slot::{SlotAccessor, SlotId, SlotIdGenerator};
use crate::types::{copy_value, Value};
use crate::{Error, Result};
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Default)]
struct EnvTable {
    names: IndexMap<String, SlotId>,
    positions: IndexMap<SlotId, usize>,
    values: Vec<(bool, Value)>,
}

#[derive(Default)]
struct EnvState {
    table: RwLock<EnvTable>,
    is_smp: AtomicBool,
}

impl Drop for EnvState {
    fn drop(&mut self) {
        let table = self.table.get_mut();
        trace!(slots = table.values.len(), "releasing runtime environment values");
        table.values.clear();
    }
}

/// Accessor reading one slot of a shared environment table.
struct EnvAccessor {
    state: Arc<EnvState>,
    position: usize,
}

impl SlotAccessor for EnvAccessor {
    fn get_view_of_value(&self) -> Value {
        self.state
            .table
            .read()
            .values
            .get(self.position)
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    }

    fn copy_or_move_value(&self) -> (bool, Value) {
        // Shared slots are never moved out.
        (true, copy_value(&self.get_view_of_value()))
    }
}

/// Process or query wide table of named global slots.
pub struct RuntimeEnvironment {
    state: Arc<EnvState>,
    accessors: RwLock<IndexMap<SlotId, Arc<EnvAccessor>>>,
}

impl Default for RuntimeEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeEnvironment {
    pub fn new() -> Self {
        Self { state: Arc::new(EnvState::default()), accessors: RwLock::new(IndexMap::new()) }
    }

    pub fn builder() -> RuntimeEnvironmentBuilder {
        RuntimeEnvironmentBuilder::default()
    }

    /// Registers `name` with an initial value and returns its new slot id.
    pub fn register_slot(
        &self,
        name: &str,
        value: Value,
        owned: bool,
        generator: &mut SlotIdGenerator,
    ) -> Result<SlotId> {
        let mut table = self.state.table.write();
        if table.names.contains_key(name) {
            return Err(Error::SlotAlreadyRegistered(name.to_string()));
        }
        let slot = generator.generate();
        let position = table.values.len();
        table.values.push((owned, value));
        table.names.insert(name.to_string(), slot);
        table.positions.insert(slot, position);
        debug!(name, slot, "registered environment slot");
        Ok(slot)
    }

    pub fn get_slot(&self, name: &str) -> Result<SlotId> {
        self.get_slot_if_exists(name).ok_or_else(|| Error::SlotNotRegistered(name.to_string()))
    }

    pub fn get_slot_if_exists(&self, name: &str) -> Option<SlotId> {
        self.state.table.read().names.get(name).copied()
    }

    /// Replaces the value of a registered slot. Not allowed once the
    /// environment is shared by parallel branches.
    pub fn reset_slot(&self, slot: SlotId, value: Value, owned: bool) -> Result<()> {
        if self.is_smp() {
            return Err(Error::ParallelReset(slot));
        }
        let mut table = self.state.table.write();
        let position = *table.positions.get(&slot).ok_or(Error::UndefinedSlot(slot))?;
        table.values[position] = (owned, value);
        Ok(())
    }

    /// Accessor of this environment copy for `slot`.
    pub fn get_accessor(&self, slot: SlotId) -> Result<Arc<dyn SlotAccessor>> {
        if let Some(accessor) = self.accessors.read().get(&slot) {
            return Ok(accessor.clone());
        }
        let position = *self
            .state
            .table
            .read()
            .positions
            .get(&slot)
            .ok_or(Error::UndefinedAccessor(slot))?;
        let accessor = self
            .accessors
            .write()
            .entry(slot)
            .or_insert_with(|| Arc::new(EnvAccessor { state: self.state.clone(), position }))
            .clone();
        Ok(accessor)
    }

    /// Forks the environment. Forking with `is_smp` marks every copy,
    /// including this one, as parallel.
    pub fn make_copy(&self, is_smp: bool) -> RuntimeEnvironment {
        if is_smp {
            self.state.is_smp.store(true, Ordering::SeqCst);
        }
        debug!(is_smp, sharers = Arc::strong_count(&self.state), "forked runtime environment");
        RuntimeEnvironment { state: self.state.clone(), accessors: RwLock::new(IndexMap::new()) }
    }

    pub fn is_smp(&self) -> bool {
        self.state.is_smp.load(Ordering::SeqCst)
    }

    /// Slot ids in registration order.
    pub fn slots(&self) -> Vec<SlotId> {
        self.state.table.read().names.values().copied().collect()
    }

    pub fn debug_string(&self) -> String {
        let table = self.state.table.read();
        let mut out = String::from("env: { ");
        for (idx, (name, slot)) in table.names.iter().enumerate() {
            if idx != 0 {
                out.push_str(", ");
            }
            let value = table
                .positions
                .get(slot)
                .and_then(|p| table.values.get(*p))
                .map(|(_, v)| v.to_string())
                .unwrap_or_default();
            let _ = write!(out, "s{} = {} ({})", slot, value, name);
        }
        out.push_str(" }");
        out
    }
}

/// Builder collecting the initial global slots of an environment.
#[derive(Default)]
pub struct RuntimeEnvironmentBuilder {
    slots: Vec<(String, Value)>,
}

impl RuntimeEnvironmentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot(mut self, name: impl Into<String>, value: Value) -> Self {
        self.slots.push((name.into(), value));
        self
    }

    /// Registers `db` under the `timeZoneDB` slot name.
    pub fn with_time_zone_db(self, db: TimeZoneDatabase) -> Self {
        self.slot(TIME_ZONE_DB_SLOT, Value::TimeZoneDb(Arc::new(db)))
    }

    pub fn build(self, generator: &mut SlotIdGenerator) -> Result<RuntimeEnvironment> {
        let env = RuntimeEnvironment::new();
        for (name, value) in self.slots {
            env.register_slot(&name, value, true, generator)?;
        }
        Ok(env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_with(name: &str, value: Value) -> (RuntimeEnvironment, SlotId) {
        let mut gen = SlotIdGenerator::new();
        let env = RuntimeEnvironment::new();
        let slot = env.register_slot(name, value, true, &mut gen).unwrap();
        (env, slot)
    }

    #[test]
    fn test_register_and_lookup() {
        let (env, slot) = env_with("limit", Value::Int32(10));
        assert_eq!(env.get_slot("limit").unwrap(), slot);
        assert_eq!(env.get_accessor(slot).unwrap().get_view_of_value(), Value::Int32(10));
        assert_eq!(env.get_slot("missing").unwrap_err().code(), 4946305);
        assert_eq!(env.get_accessor(99).err().map(|e| e.code()), Some(4946301));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut gen = SlotIdGenerator::new();
        let env = RuntimeEnvironment::new();
        env.register_slot("a", Value::Null, false, &mut gen).unwrap();
        let err = env.register_slot("a", Value::Null, false, &mut gen).unwrap_err();
        assert_eq!(err.code(), 4946303);
    }

    #[test]
    fn test_reset_slot() {
        let (env, slot) = env_with("x", Value::Int32(1));
        env.reset_slot(slot, Value::Int32(2), false).unwrap();
        assert_eq!(env.get_accessor(slot).unwrap().get_view_of_value(), Value::Int32(2));
        assert_eq!(env.reset_slot(42, Value::Null, false).unwrap_err().code(), 4946300);
    }

    #[test]
    fn test_copies_share_values_but_not_accessors() {
        let (env, slot) = env_with("x", Value::string("shared value"));
        let copy = env.make_copy(false);
        let a = env.get_accessor(slot).unwrap();
        let b = copy.get_accessor(slot).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        env.reset_slot(slot, Value::Int32(5), true).unwrap();
        assert_eq!(b.get_view_of_value(), Value::Int32(5));
    }

    #[test]
    fn test_parallel_flag_is_infectious() {
        let (env, slot) = env_with("x", Value::Int32(1));
        assert!(!env.is_smp());
        let branch = env.make_copy(true);
        assert!(env.is_smp());
        assert!(branch.is_smp());
        assert_eq!(env.reset_slot(slot, Value::Int32(3), false).unwrap_err().code(), 4946304);
        assert_eq!(branch.reset_slot(slot, Value::Int32(3), false).unwrap_err().code(), 4946304);
    }

    #[test]
    fn test_values_outlive_original_environment() {
        let (env, slot) = env_with("x", Value::string("kept alive by the copy"));
        let copy = env.make_copy(true);
        drop(env);
        let acc = copy.get_accessor(slot).unwrap();
        assert_eq!(acc.get_view_of_value().as_str(), Some("kept alive by the copy"));
    }

    #[test]
    fn test_builder_registers_time_zone_db() {
        let mut gen = SlotIdGenerator::new();
        let env = RuntimeEnvironment::builder()
            .slot("answer", Value::Int32(42))
            .with_time_zone_db(TimeZoneDatabase::new())
            .build(&mut gen)
            .unwrap();
        let slot = env.get_slot(TIME_ZONE_DB_SLOT).unwrap();
        assert!(matches!(env.get_accessor(slot).unwrap().get_view_of_value(), Value::TimeZoneDb(_)));
        assert_eq!(env.slots().len(), 2);
        assert!(env.debug_string().contains("s0 = 42 (answer)"));
    }
}
