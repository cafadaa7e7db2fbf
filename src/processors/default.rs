//! Default processor — the fallback for unmatched or unparsed intents.
//!
//! It does no external work: it acknowledges the request, records the
//! description as its output, and flags the result for review so a human
//! decides what to do with work the system could not classify.

use async_trait::async_trait;

use crate::intent::DEFAULT_INTENT;
use crate::processors::{ExecutionContext, Processor, ProcessorError, ProcessorOutput};

pub struct DefaultProcessor;

impl DefaultProcessor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DefaultProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Processor for DefaultProcessor {
    fn intent(&self) -> &str {
        DEFAULT_INTENT
    }

    fn max_retries(&self) -> u32 {
        1
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<ProcessorOutput, ProcessorError> {
        ctx.report_progress(50, "recording unclassified request")
            .await?;

        let task = ctx.task().await;

        ctx.check_cancelled()?;

        Ok(ProcessorOutput::json(serde_json::json!({
            "acknowledged": true,
            "description": task.description,
        }))
        .with_review())
    }
}
