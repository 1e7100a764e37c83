// Two-phase staging of the task environment.
//
// Phase one merges the plan's variables, expanded against the agent's own
// process environment and then against each other. Phase two resolves boxed
// secrets, each looked up with a fully expanded copy of the staged variables
// so a secret reference can be composed from plain ones.

use agent_common::constants::variables;
use agent_common::{is_boxed_value, stage_custom_environment, AgentError, Environment, SecretMasker};
use std::collections::HashMap;
use std::path::Path;

use crate::collaborators::{SecretResolutionError, SecretResolver};

/// Phase one: build the run-wide environment from the plan.
pub fn stage(
    plan_environment: &HashMap<String, String>,
    process_environment: &HashMap<String, String>,
    working_directory: &Path,
    task_id: &str,
    masker: SecretMasker,
) -> Environment {
    let mut custom: HashMap<String, String> = HashMap::new();
    custom.insert(variables::CI.to_string(), "true".to_string());
    custom.insert(
        variables::WORKING_DIR.to_string(),
        working_directory.to_string_lossy().to_string(),
    );
    if !task_id.is_empty() {
        custom.insert(variables::TASK_ID.to_string(), task_id.to_string());
    }
    custom.extend(plan_environment.iter().map(|(k, v)| (k.clone(), v.clone())));

    Environment::from_map(stage_custom_environment(process_environment, &custom), masker)
}

/// Phase two: replace every boxed value with its resolved secret and mark it
/// sensitive. Stops at the first resolution failure.
pub async fn resolve_boxed_secrets(
    environment: &Environment,
    resolver: &dyn SecretResolver,
) -> Result<usize, AgentError> {
    let expanded = environment.expanded();
    let mut boxed: Vec<(&String, &String)> = expanded
        .iter()
        .filter(|(_, value)| is_boxed_value(value))
        .collect();
    boxed.sort();

    let mut resolved = 0;
    for (key, value) in boxed {
        match resolver.resolve(value, &expanded).await {
            Ok(plain) => {
                environment.set_sensitive(key.clone(), plain);
                resolved += 1;
            }
            Err(SecretResolutionError::NotBoxed) => {}
            Err(SecretResolutionError::Failed(message)) => {
                return Err(AgentError::SecretResolution {
                    key: key.clone(),
                    message,
                })
            }
        }
    }
    Ok(resolved)
}
