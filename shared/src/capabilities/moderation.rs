use crux_core::capability::{Capability, CapabilityContext, Operation};
use serde::{Deserialize, Serialize};

use super::filter::{Classifier, ClassifyResult};

/// Access to the shell's toxicity model.
#[derive(Clone)]
pub struct Moderation<E> {
    context: CapabilityContext<ModerationOperation, E>,
}

impl<Ev> Capability<Ev> for Moderation<Ev> {
    type Operation = ModerationOperation;
    type MappedSelf<MappedEv> = Moderation<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        Moderation::new(self.context.map_event(f))
    }
}

impl<E> Moderation<E>
where
    E: Send + 'static,
{
    pub fn new(context: CapabilityContext<ModerationOperation, E>) -> Self {
        Self { context }
    }

    /// `text` should already be prepared for the model (emoji spelled out).
    pub fn classify<F>(&self, text: String, threshold: f32, callback: F)
    where
        F: FnOnce(ClassifyResult) -> E + Send + 'static,
    {
        let ctx = self.context.clone();
        self.context.spawn(async move {
            let result = ctx
                .request_from_shell(ModerationOperation::Classify { text, threshold })
                .await;
            ctx.update_app(callback(result));
        });
    }
}


#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ModerationOperation {
    Classify { text: String, threshold: f32 },
}

impl Operation for ModerationOperation {
    type Output = ClassifyResult;
}

/// Shell side of the capability: runs one request against a [`Classifier`].
pub async fn serve<C>(classifier: &C, operation: ModerationOperation) -> ClassifyResult
where
    C: Classifier + ?Sized,
{
    match operation {
        ModerationOperation::Classify { text, threshold } => {
            classifier.classify(&text, threshold).await
        }
    }
}
