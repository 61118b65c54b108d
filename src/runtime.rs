//! Wiring between the instrumentation engine and the probe pipeline.
//!
//! The engine invokes [`CmpTraceRuntime::instrument`] once per static
//! instruction it discovers. For each installed plan it then arranges to
//! call [`CmpTraceRuntime::run_probe`] inline, with a fresh register
//! snapshot, at every dynamic execution of that instruction.

use crate::{
    insn::DecodedInsn,
    map::TraceMap,
    plan::ProbePlan,
    resolve::{resolve, CpuContext, MemoryOracle},
};

/// The instrumentation-engine surface the entry point drives.
///
/// An implementation owns the installed plans as part of its compiled-code
/// cache and discards them when the cache entry is invalidated. Plans are
/// immutable after installation and may be invoked from any target thread.
pub trait ProbeSink {
    /// Insert an inline probe at the code point currently being
    /// instrumented.
    fn install_probe(&mut self, plan: ProbePlan);
}

/// The value-capture engine's entry point.
///
/// References the harness-owned [`TraceMap`] and the readability oracle.
/// Constructed without a map, the engine is disabled and every call
/// becomes a no-op.
#[derive(Debug)]
pub struct CmpTraceRuntime<'m, O> {
    map: Option<&'m mut TraceMap>,
    oracle: O,
}

impl<'m, O> CmpTraceRuntime<'m, O>
where
    O: MemoryOracle,
{
    /// Create a runtime over a harness-provided map.
    #[must_use]
    pub fn new(map: Option<&'m mut TraceMap>, oracle: O) -> Self {
        Self { map, oracle }
    }

    /// Whether a trace map was provided.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.map.is_some()
    }

    /// Classify one discovered instruction and install a probe for it if
    /// it is eligible.
    pub fn instrument<S>(&self, insn: &DecodedInsn, sink: &mut S)
    where
        S: ProbeSink,
    {
        if self.map.is_none() {
            return;
        }

        if let Some(plan) = ProbePlan::classify(insn) {
            sink.install_probe(plan);
        }
    }

    /// Execute one probe inline: resolve the operand values from the
    /// snapshot and log them. Unresolvable events are dropped silently.
    #[inline]
    pub fn run_probe<C>(&mut self, plan: &ProbePlan, ctx: &C)
    where
        C: CpuContext,
    {
        let Some(map) = self.map.as_deref_mut() else {
            return;
        };

        if let Some(event) = resolve(plan, ctx, &self.oracle) {
            map.record(&event);
        }
    }
}
