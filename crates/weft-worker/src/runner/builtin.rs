// Built-in runner: dispatches to the in-process implementations, no
// container involved.

use async_trait::async_trait;

use weft_core::builtin::{Builtin, BuiltinContext};
use weft_core::error::{Error, Result};
use weft_core::package::StepRequirement;

use super::{StepContext, StepOutputs, StepRunner};

pub struct BuiltinRunner;

impl BuiltinRunner {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BuiltinRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepRunner for BuiltinRunner {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutputs> {
        let process = match &ctx.requirement {
            StepRequirement::Builtin { process } => process.clone(),
            other => {
                return Err(Error::step(
                    &ctx.step_id,
                    format!("builtin runner received {:?}", other),
                ))
            }
        };
        let builtin = Builtin::by_id(&process)
            .ok_or_else(|| Error::not_found(format!("builtin process '{}'", process)))?;
        tracing::info!(step = %ctx.step_id, builtin = %process, "running builtin");
        let context = BuiltinContext {
            fetcher: &ctx.fetcher,
            work_dir: &ctx.work_dir,
        };
        builtin.run(&context, &ctx.inputs).await
    }
}
