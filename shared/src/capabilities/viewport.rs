use crux_core::capability::{Capability, CapabilityContext, Operation};
use serde::{Deserialize, Serialize};

use crate::event::ScrollRequest;

/// Scroll commands for the shell's message list container.
#[derive(Clone)]
pub struct Viewport<E> {
    context: CapabilityContext<ViewportOperation, E>,
}

impl<Ev> Capability<Ev> for Viewport<Ev> {
    type Operation = ViewportOperation;
    type MappedSelf<MappedEv> = Viewport<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        Viewport::new(self.context.map_event(f))
    }
}

impl<E> Viewport<E>
where
    E: Send + 'static,
{
    pub fn new(context: CapabilityContext<ViewportOperation, E>) -> Self {
        Self { context }
    }

    pub fn scroll(&self, request: ScrollRequest) {
        let ctx = self.context.clone();
        self.context.spawn(async move {
            ctx.notify_shell(ViewportOperation::ScrollTo(request)).await;
        });
    }
}


#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum ViewportOperation {
    ScrollTo(ScrollRequest),
}

impl Operation for ViewportOperation {
    type Output = ();
}
