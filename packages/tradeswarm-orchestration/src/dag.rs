use crate::error::{OrchestratorError, Result};
use crate::pipeline::{DegradedPolicy, Pipeline};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tradeswarm_storage::OutputKind;

/// Validated set of pipelines for one session
///
/// Pipelines never call each other; the dependency graph only exists to
/// reject sets that could never finish (cycles, inputs nobody produces) and to
/// log the expected execution phases.
#[derive(Clone)]
pub struct PipelineSet {
    pipelines: BTreeMap<OutputKind, Arc<dyn Pipeline>>,
    dependencies: BTreeMap<OutputKind, Vec<OutputKind>>,
    phases: Vec<Vec<OutputKind>>, // Vec of parallel groups
}

impl PipelineSet {
    pub fn new(pipelines: Vec<Arc<dyn Pipeline>>) -> Result<Self> {
        let mut by_kind: BTreeMap<OutputKind, Arc<dyn Pipeline>> = BTreeMap::new();
        for pipeline in pipelines {
            let kind = pipeline.output_kind();
            if by_kind.insert(kind, pipeline).is_some() {
                return Err(OrchestratorError::DuplicatePipeline(kind.to_string()));
            }
        }

        // Validate dependencies exist
        let mut dependencies = BTreeMap::new();
        for (kind, pipeline) in &by_kind {
            let mut deps = Vec::new();
            if let Some(requirement) = pipeline.requirement() {
                for dep in &requirement.kinds {
                    if by_kind.contains_key(dep) {
                        deps.push(*dep);
                    } else if requirement.on_timeout == DegradedPolicy::Abort {
                        return Err(OrchestratorError::MissingDependency(format!(
                            "{} requires {} but no pipeline produces it",
                            kind, dep
                        )));
                    }
                }
            }
            dependencies.insert(*kind, deps);
        }

        let phases = Self::topological_sort(&dependencies)?;

        Ok(Self {
            pipelines: by_kind,
            dependencies,
            phases,
        })
    }

    /// Layered topological sort; each layer can run in parallel
    fn topological_sort(
        dependencies: &BTreeMap<OutputKind, Vec<OutputKind>>,
    ) -> Result<Vec<Vec<OutputKind>>> {
        let mut in_degree: BTreeMap<OutputKind, usize> = dependencies
            .iter()
            .map(|(kind, deps)| (*kind, deps.len()))
            .collect();

        let mut result = Vec::new();
        let mut processed = BTreeSet::new();

        while processed.len() < dependencies.len() {
            let ready: Vec<OutputKind> = in_degree
                .iter()
                .filter(|(_, &degree)| degree == 0)
                .map(|(&kind, _)| kind)
                .collect();

            if ready.is_empty() {
                let stuck = in_degree
                    .keys()
                    .map(|k| k.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(OrchestratorError::DagCycleDetected(stuck));
            }

            for kind in &ready {
                processed.insert(*kind);
                in_degree.remove(kind);

                // Decrement dependents
                for (dependent, deps) in dependencies {
                    if deps.contains(kind) {
                        if let Some(degree) = in_degree.get_mut(dependent) {
                            *degree = degree.saturating_sub(1);
                        }
                    }
                }
            }

            result.push(ready);
        }

        Ok(result)
    }

    pub fn phases(&self) -> &[Vec<OutputKind>] {
        &self.phases
    }

    pub fn dependencies_of(&self, kind: OutputKind) -> &[OutputKind] {
        self.dependencies
            .get(&kind)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn pipelines(&self) -> impl Iterator<Item = &Arc<dyn Pipeline>> {
        self.pipelines.values()
    }

    pub fn kinds(&self) -> Vec<OutputKind> {
        self.pipelines.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// Get execution plan as string (for logging)
    pub fn execution_plan(&self) -> String {
        self.phases
            .iter()
            .enumerate()
            .map(|(i, group)| {
                let names: Vec<_> = group.iter().map(|k| k.as_str()).collect();

                if group.len() > 1 {
                    format!("Phase {}: {} (parallel)", i + 1, names.join(" ∥ "))
                } else {
                    format!("Phase {}: {}", i + 1, names.join(""))
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl std::fmt::Debug for PipelineSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineSet")
            .field("kinds", &self.kinds())
            .field("phases", &self.phases)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{InputRequirement, PipelineContext, PipelineInputs};
    use async_trait::async_trait;
    use serde_json::Value;

    struct Stub {
        kind: OutputKind,
        requirement: Option<InputRequirement>,
    }

    #[async_trait]
    impl Pipeline for Stub {
        fn output_kind(&self) -> OutputKind {
            self.kind
        }

        fn producer_id(&self) -> &str {
            "stub"
        }

        fn requirement(&self) -> Option<&InputRequirement> {
            self.requirement.as_ref()
        }

        async fn execute(&self, _ctx: &PipelineContext, _inputs: PipelineInputs) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    fn leaf(kind: OutputKind) -> Arc<dyn Pipeline> {
        Arc::new(Stub {
            kind,
            requirement: None,
        })
    }

    fn dependent(kind: OutputKind, deps: &[OutputKind]) -> Arc<dyn Pipeline> {
        Arc::new(Stub {
            kind,
            requirement: Some(InputRequirement::all_of(deps.iter().copied())),
        })
    }

    fn full_set() -> Vec<Arc<dyn Pipeline>> {
        let mut pipelines: Vec<_> = OutputKind::leaf_kinds().into_iter().map(leaf).collect();
        pipelines.push(dependent(OutputKind::ResearchReport, &OutputKind::leaf_kinds()));
        pipelines.push(dependent(OutputKind::TradingDecision, &[OutputKind::ResearchReport]));
        pipelines
    }

    #[test]
    fn test_phases_for_full_session() {
        let set = PipelineSet::new(full_set()).unwrap();
        let phases = set.phases();

        assert_eq!(phases.len(), 3);
        assert_eq!(phases[0], OutputKind::leaf_kinds().to_vec());
        assert_eq!(phases[1], vec![OutputKind::ResearchReport]);
        assert_eq!(phases[2], vec![OutputKind::TradingDecision]);
        assert_eq!(set.len(), 6);
        assert_eq!(set.dependencies_of(OutputKind::TradingDecision), &[OutputKind::ResearchReport]);
    }

    #[test]
    fn test_duplicate_kind_rejected() {
        let result = PipelineSet::new(vec![
            leaf(OutputKind::NewsAnalysis),
            leaf(OutputKind::NewsAnalysis),
        ]);
        assert!(matches!(result, Err(OrchestratorError::DuplicatePipeline(_))));
    }

    #[test]
    fn test_missing_producer_rejected_under_abort() {
        let result = PipelineSet::new(vec![dependent(
            OutputKind::TradingDecision,
            &[OutputKind::ResearchReport],
        )]);
        assert!(matches!(result, Err(OrchestratorError::MissingDependency(_))));
    }

    #[test]
    fn test_missing_producer_allowed_when_degrading() {
        let research: Arc<dyn Pipeline> = Arc::new(Stub {
            kind: OutputKind::ResearchReport,
            requirement: Some(
                InputRequirement::all_of([OutputKind::MarketAnalysis, OutputKind::NewsAnalysis])
                    .with_policy(DegradedPolicy::ProceedWithAvailable),
            ),
        });
        let set = PipelineSet::new(vec![leaf(OutputKind::MarketAnalysis), research]).unwrap();

        assert_eq!(set.dependencies_of(OutputKind::ResearchReport), &[OutputKind::MarketAnalysis]);
        assert_eq!(set.phases().len(), 2);
    }

    #[test]
    fn test_cycle_detected() {
        let result = PipelineSet::new(vec![
            dependent(OutputKind::ResearchReport, &[OutputKind::TradingDecision]),
            dependent(OutputKind::TradingDecision, &[OutputKind::ResearchReport]),
        ]);

        match result {
            Err(OrchestratorError::DagCycleDetected(kinds)) => {
                assert!(kinds.contains("research_report"));
                assert!(kinds.contains("trading_decision"));
            }
            other => panic!("expected cycle, got {:?}", other.map(|s| s.kinds())),
        }
    }

    #[test]
    fn test_execution_plan_string() {
        let plan = PipelineSet::new(full_set()).unwrap().execution_plan();

        assert!(plan.contains("Phase 1:"));
        assert!(plan.contains("market_analysis ∥ social_analysis"));
        assert!(plan.contains("(parallel)"));
        assert!(plan.contains("Phase 3: trading_decision"));
    }
}
