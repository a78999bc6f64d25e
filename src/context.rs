//! Context module: per-compilation state resolving slots to accessors.

use crate::env::RuntimeEnvironment;
use crate::slot::{FrameId, FrameIdGenerator, OwnedValueAccessor, SlotAccessor, SlotId};
use crate::Result;
use indexmap::IndexMap;
use std::sync::Arc;

/// Source of per-row accessors, typically the plan stage that drives the VM.
pub trait SlotResolver: Send + Sync {
    fn get_accessor(&self, slot: SlotId) -> Option<Arc<dyn SlotAccessor>>;
}

/// A fixed table of row accessors.
#[derive(Default, Clone)]
pub struct SlotTable {
    accessors: IndexMap<SlotId, Arc<dyn SlotAccessor>>,
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, slot: SlotId, accessor: Arc<dyn SlotAccessor>) {
        self.accessors.insert(slot, accessor);
    }

    /// Adds an empty owned accessor for `slot` and returns it for the row
    /// source to fill in.
    pub fn bind(&mut self, slot: SlotId) -> Arc<OwnedValueAccessor> {
        let accessor = Arc::new(OwnedValueAccessor::new());
        self.accessors.insert(slot, accessor.clone());
        accessor
    }

    pub fn len(&self) -> usize {
        self.accessors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accessors.is_empty()
    }
}

impl SlotResolver for SlotTable {
    fn get_accessor(&self, slot: SlotId) -> Option<Arc<dyn SlotAccessor>> {
        self.accessors.get(&slot).cloned()
    }
}

/// Mutable state of one compilation.
///
/// Slots resolve through the correlated stack (innermost first), then the
/// root resolver, then the runtime environment.
pub struct CompileCtx {
    env: RuntimeEnvironment,
    root: Option<Arc<dyn SlotResolver>>,
    correlated: Vec<(SlotId, Arc<dyn SlotAccessor>)>,
    agg_expression: bool,
    accumulator: Option<Arc<OwnedValueAccessor>>,
    frames: FrameIdGenerator,
}

impl CompileCtx {
    pub fn new(env: RuntimeEnvironment) -> Self {
        Self {
            env,
            root: None,
            correlated: Vec::new(),
            agg_expression: false,
            accumulator: None,
            frames: FrameIdGenerator::new(),
        }
    }

    pub fn with_root(mut self, root: Arc<dyn SlotResolver>) -> Self {
        self.root = Some(root);
        self
    }

    pub fn env(&self) -> &RuntimeEnvironment {
        &self.env
    }

    pub fn get_accessor(&self, slot: SlotId) -> Result<Arc<dyn SlotAccessor>> {
        if let Some((_, accessor)) = self.correlated.iter().rev().find(|(s, _)| *s == slot) {
            return Ok(accessor.clone());
        }
        if let Some(accessor) = self.root.as_ref().and_then(|root| root.get_accessor(slot)) {
            return Ok(accessor);
        }
        self.env.get_accessor(slot)
    }

    /// Shadows `slot` with `accessor` until the matching [`pop_correlated`](Self::pop_correlated).
    pub fn push_correlated(&mut self, slot: SlotId, accessor: Arc<dyn SlotAccessor>) {
        self.correlated.push((slot, accessor));
    }

    pub fn pop_correlated(&mut self) -> Option<(SlotId, Arc<dyn SlotAccessor>)> {
        self.correlated.pop()
    }

    /// Enters an aggregate expression whose running state lives in `accumulator`.
    pub fn begin_aggregate(&mut self, accumulator: Arc<OwnedValueAccessor>) {
        self.agg_expression = true;
        self.accumulator = Some(accumulator);
    }

    pub fn end_aggregate(&mut self) {
        self.agg_expression = false;
    }

    pub fn agg_expression(&self) -> bool {
        self.agg_expression
    }

    pub fn accumulator(&self) -> Option<&Arc<OwnedValueAccessor>> {
        self.accumulator.as_ref()
    }

    /// The accumulator, if currently compiling an aggregate expression.
    pub(crate) fn aggregate_accumulator(&self) -> Option<Arc<dyn SlotAccessor>> {
        if !self.agg_expression {
            return None;
        }
        self.accumulator.clone().map(|acc| acc as Arc<dyn SlotAccessor>)
    }

    pub fn new_frame_id(&mut self) -> FrameId {
        self.frames.generate()
    }

    /// Independent context for another execution branch. The environment is
    /// forked with `is_smp`; correlated bindings and the root resolver are
    /// carried over, aggregate state is not.
    pub fn make_copy(&self, is_smp: bool) -> CompileCtx {
        CompileCtx {
            env: self.env.make_copy(is_smp),
            root: self.root.clone(),
            correlated: self.correlated.clone(),
            agg_expression: false,
            accumulator: None,
            frames: self.frames.clone(),
        }
    }
}
