// ESGF-CWT runner: the compute service speaks the WPS 1.0 dialect with an
// API key carried as a bearer token, so execution delegates to the WPS
// runner after rewriting the endpoint.

use async_trait::async_trait;

use weft_core::error::{Error, Result};
use weft_core::package::StepRequirement;

use super::wps1::Wps1Runner;
use super::{StepContext, StepOutputs, StepRunner};

pub struct EsgfCwtRunner {
    wps: Wps1Runner,
}

impl EsgfCwtRunner {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            wps: Wps1Runner::new(client),
        }
    }
}

#[async_trait]
impl StepRunner for EsgfCwtRunner {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutputs> {
        let StepRequirement::EsgfCwt { provider, process } = &ctx.requirement else {
            return Err(Error::step(
                &ctx.step_id,
                format!("ESGF-CWT runner received {:?}", ctx.requirement),
            ));
        };
        if ctx.auth.bearer.is_none() {
            tracing::warn!(step = %ctx.step_id, "ESGF-CWT step without an API key");
        }
        let mut delegated = ctx.clone();
        delegated.requirement = StepRequirement::Wps1 {
            provider: provider.clone(),
            process: process.clone(),
        };
        self.wps.execute(&delegated).await
    }
}
