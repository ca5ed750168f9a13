//! Ordered stage descriptors

use tracing::debug;

use crate::config::Config;
use crate::error::ConfigError;
use crate::stage::{CommandUnit, Stage, StageUnit};

/// One stage of a plan: what runs and under which audit name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDescriptor {
    pub stage: Stage,
    pub process_name: String,
    pub unit: StageUnit,
}

impl StageDescriptor {
    /// Descriptor using the stage's default audit process name
    pub fn new(stage: Stage, unit: StageUnit) -> Self {
        Self {
            stage,
            process_name: stage.process_name().to_string(),
            unit,
        }
    }
}

/// Stages to run, in canonical order
#[derive(Debug, Clone, Default)]
pub struct PipelinePlan {
    stages: Vec<StageDescriptor>,
}

impl PipelinePlan {
    pub fn new(stages: Vec<StageDescriptor>) -> Result<Self, ConfigError> {
        Self::validate_order(&stages)?;
        Ok(Self { stages })
    }

    /// Reject descriptors that are duplicated or out of canonical order
    pub fn validate_order(stages: &[StageDescriptor]) -> Result<(), ConfigError> {
        let problems: Vec<String> = stages
            .windows(2)
            .filter(|pair| pair[0].stage >= pair[1].stage)
            .map(|pair| {
                if pair[0].stage == pair[1].stage {
                    format!("stage {} appears more than once", pair[1].stage)
                } else {
                    format!("stage {} must not run after {}", pair[1].stage, pair[0].stage)
                }
            })
            .collect();

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// Build the plan described by a configuration
    ///
    /// The generate stage is included only when configured.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        debug!("PipelinePlan::from_config: called");
        let stages = &config.stages;
        let mut descriptors = Vec::with_capacity(Stage::ALL.len());

        if let Some(generate) = &stages.generate {
            descriptors.push(StageDescriptor::new(
                Stage::Generate,
                StageUnit::Command(CommandUnit::from(generate)),
            ));
        }
        descriptors.push(StageDescriptor {
            stage: Stage::Bronze,
            process_name: stages.bronze.process_name.clone(),
            unit: StageUnit::IncrementalLoad {
                tables: stages.bronze.tables.clone(),
            },
        });
        descriptors.push(StageDescriptor::new(
            Stage::Silver,
            StageUnit::SqlScript {
                path: stages.silver.script.clone(),
            },
        ));
        descriptors.push(StageDescriptor::new(
            Stage::Gold,
            StageUnit::SqlScript {
                path: stages.gold.script.clone(),
            },
        ));

        Self::new(descriptors)
    }

    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    pub fn get(&self, stage: Stage) -> Option<&StageDescriptor> {
        self.stages.iter().find(|d| d.stage == stage)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommandConfig;
    use std::path::PathBuf;

    fn script(stage: Stage) -> StageDescriptor {
        StageDescriptor::new(
            stage,
            StageUnit::SqlScript {
                path: PathBuf::from(format!("{}.sql", stage)),
            },
        )
    }

    #[test]
    fn test_from_config_without_generate() {
        let plan = PipelinePlan::from_config(&Config::default()).unwrap();
        let stages: Vec<Stage> = plan.stages().iter().map(|d| d.stage).collect();
        assert_eq!(stages, vec![Stage::Bronze, Stage::Silver, Stage::Gold]);
        assert!(plan.get(Stage::Generate).is_none());
    }

    #[test]
    fn test_from_config_with_generate_and_custom_bronze_name() {
        let mut config = Config::default();
        config.stages.generate = Some(CommandConfig {
            program: "python3".to_string(),
            ..Default::default()
        });
        config.stages.bronze.process_name = "bronze_load".to_string();

        let plan = PipelinePlan::from_config(&config).unwrap();
        assert_eq!(plan.len(), 4);
        assert_eq!(plan.stages()[0].stage, Stage::Generate);
        assert_eq!(plan.stages()[0].process_name, "data_generation");
        assert_eq!(plan.get(Stage::Bronze).unwrap().process_name, "bronze_load");
    }

    #[test]
    fn test_validate_order_rejects_out_of_order() {
        let err = PipelinePlan::new(vec![script(Stage::Gold), script(Stage::Silver)]).unwrap_err();
        assert!(err.to_string().contains("stage silver must not run after gold"));
    }

    #[test]
    fn test_validate_order_rejects_duplicates() {
        let err = PipelinePlan::new(vec![script(Stage::Silver), script(Stage::Silver)]).unwrap_err();
        assert!(err.to_string().contains("appears more than once"));
    }

    #[test]
    fn test_validate_order_allows_gaps() {
        assert!(PipelinePlan::new(vec![script(Stage::Bronze), script(Stage::Gold)]).is_ok());
        assert!(PipelinePlan::new(Vec::new()).unwrap().is_empty());
    }
}
