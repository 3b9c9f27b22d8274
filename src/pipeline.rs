use crate::config::StudyConfig;
use crate::error::KiraError;
use crate::runner::{StageResult, StageRunner, StageStatus};
use crate::stage::{DEFAULT_ORDER, OPTIONAL_STAGES, Stage, StageRegistry};
use crate::unit::UnitOfWork;

/// All stage names in execution order, with `b1` moved to run right after
/// `b1_after` and the optional stages last.
pub fn canonical_order(b1_after: &str) -> Vec<&'static str> {
    let mut order: Vec<&'static str> = DEFAULT_ORDER
        .iter()
        .copied()
        .filter(|name| *name != "b1")
        .collect();
    let at = order
        .iter()
        .position(|name| *name == b1_after)
        .map(|index| index + 1)
        .unwrap_or(2);
    order.insert(at.min(order.len()), "b1");
    order.extend(OPTIONAL_STAGES);
    order
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    pub force: bool,
    pub stop_on_failure: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            force: false,
            stop_on_failure: true,
        }
    }
}

#[derive(Debug)]
pub struct PipelineReport {
    pub unit: String,
    pub results: Vec<StageResult>,
}

impl PipelineReport {
    pub fn failures(&self) -> impl Iterator<Item = &StageResult> {
        self.results.iter().filter(|result| result.is_failed())
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }

    /// The aggregated error for every failed stage, if any failed.
    pub fn error(&self) -> Option<KiraError> {
        let failures: Vec<String> = self
            .failures()
            .filter_map(StageResult::failure_summary)
            .collect();
        if failures.is_empty() {
            return None;
        }
        let external = self
            .failures()
            .any(|result| result.error.as_ref().is_some_and(KiraError::is_external));
        Some(KiraError::PipelineFailed {
            unit: self.unit.clone(),
            failures,
            external,
        })
    }
}

#[derive(Debug)]
pub struct Pipeline<'r> {
    stages: Vec<&'r Stage>,
}

impl<'r> Pipeline<'r> {
    /// The default run: every stage of the canonical order except the optional ones.
    pub fn default_for(registry: &'r StageRegistry, config: &StudyConfig) -> Result<Self, KiraError> {
        let names: Vec<&str> = canonical_order(&config.b1_after)
            .into_iter()
            .filter(|name| !OPTIONAL_STAGES.contains(name))
            .collect();
        Self::from_names(registry, &names)
    }

    /// The named stages, reordered into canonical order.
    pub fn select<S: AsRef<str>>(
        registry: &'r StageRegistry,
        config: &StudyConfig,
        names: &[S],
    ) -> Result<Self, KiraError> {
        for name in names {
            registry.get(name.as_ref())?;
        }
        let selected: Vec<&str> = canonical_order(&config.b1_after)
            .into_iter()
            .filter(|name| names.iter().any(|wanted| wanted.as_ref() == *name))
            .collect();
        Self::from_names(registry, &selected)
    }

    fn from_names(registry: &'r StageRegistry, names: &[&str]) -> Result<Self, KiraError> {
        let stages = names
            .iter()
            .map(|name| registry.get(name))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { stages })
    }

    pub fn without(mut self, name: &str) -> Self {
        self.stages.retain(|stage| stage.name() != name);
        self
    }

    pub fn with(
        self,
        registry: &'r StageRegistry,
        config: &StudyConfig,
        name: &str,
    ) -> Result<Self, KiraError> {
        let mut names = self.names();
        if !names.contains(&name) {
            names.push(name);
        }
        Self::select(registry, config, &names)
    }

    pub fn stages(&self) -> &[&'r Stage] {
        &self.stages
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Runs the stages in order for one unit. With `stop_on_failure` the
    /// first failure ends the run; otherwise every stage is attempted.
    pub fn run(
        &self,
        runner: &StageRunner<'_>,
        unit: &UnitOfWork,
        config: &StudyConfig,
        options: PipelineOptions,
    ) -> PipelineReport {
        let mut results = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let result = runner.run(stage, unit, config, options.force);
            match result.status {
                StageStatus::Success => tracing::info!("{unit}: {} done", stage.name()),
                StageStatus::Skipped => tracing::info!("{unit}: {} skipped", stage.name()),
                StageStatus::Failed => {
                    if let Some(summary) = result.failure_summary() {
                        tracing::error!("{unit}: {summary}");
                    }
                }
            }
            let failed = result.is_failed();
            results.push(result);
            if failed && options.stop_on_failure {
                tracing::warn!("{unit}: stopping after {} failed", stage.name());
                break;
            }
        }
        PipelineReport {
            unit: unit.to_string(),
            results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_order_places_b1_after_src2rawdata() {
        let order = canonical_order("src2rawdata");
        assert_eq!(&order[..9], &DEFAULT_ORDER[..]);
        assert_eq!(order.last(), Some(&"qc"));
    }

    #[test]
    fn b1_position_follows_config() {
        let order = canonical_order("fixepi");
        let fixepi = order.iter().position(|name| *name == "fixepi").unwrap();
        assert_eq!(order[fixepi + 1], "b1");
        assert_eq!(order.iter().filter(|name| **name == "b1").count(), 1);
    }
}
