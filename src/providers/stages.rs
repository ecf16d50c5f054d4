//! `StageCall` adapters wiring concrete provider calls into the Unified
//! Processor's generic fallback/continuation state machine (§4.5, §4.6 step
//! 3, §4.7 steps 3-4). Each continuation call carries the accumulated text
//! back to the provider and asks it to resume (§4.5 step 3).

use async_trait::async_trait;

use crate::error::ProviderError;

use super::processor::StageCall;
use super::{CallOptions, FileApiProvider, FileRef, Provider, VisionProvider};
use std::sync::Arc;

pub struct VisionExtractStage {
    pub provider: Arc<dyn VisionProvider>,
    pub base64_image: String,
    pub mime: String,
    pub prompt: String,
    pub continuation_prompt: String,
    pub opts: CallOptions,
}

#[async_trait]
impl StageCall for VisionExtractStage {
    async fn call(&self, continuation_context: Option<&str>) -> Result<String, ProviderError> {
        match continuation_context {
            None => self.provider.extract_image(&self.base64_image, &self.mime, &self.prompt, &self.opts).await,
            Some(accumulated) => {
                let resume = format!("{}\n\nAlready extracted so far:\n{}\n\nContinue exactly where this left off; do not repeat any of it.", self.continuation_prompt, accumulated);
                self.provider.extract_image(&self.base64_image, &self.mime, &resume, &self.opts).await
            }
        }
    }
}

pub struct FileExtractStage {
    pub provider: Arc<dyn FileApiProvider>,
    pub file_ref: FileRef,
    pub prompt: String,
    pub continuation_prompt: String,
    pub opts: CallOptions,
}

#[async_trait]
impl StageCall for FileExtractStage {
    async fn call(&self, continuation_context: Option<&str>) -> Result<String, ProviderError> {
        match continuation_context {
            None => self.provider.extract_file(&self.file_ref, &self.prompt, &self.opts).await,
            Some(accumulated) => {
                let resume = format!("{}\n\nAlready extracted so far:\n{}\n\nContinue exactly where this left off; do not repeat any of it.", self.continuation_prompt, accumulated);
                self.provider.extract_file(&self.file_ref, &resume, &self.opts).await
            }
        }
    }
}

pub struct BoostStage {
    pub provider: Arc<dyn Provider>,
    pub text: String,
    pub prompt: String,
    pub continuation_prompt: String,
    pub opts: CallOptions,
}

#[async_trait]
impl StageCall for BoostStage {
    async fn call(&self, continuation_context: Option<&str>) -> Result<String, ProviderError> {
        match continuation_context {
            None => self.provider.boost(&self.text, &self.prompt, &self.opts).await,
            Some(accumulated) => self.provider.boost(accumulated, &self.continuation_prompt, &self.opts).await,
        }
    }
}
