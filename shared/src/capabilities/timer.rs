use crux_core::capability::{Capability, CapabilityContext, Operation};
use serde::{Deserialize, Serialize};


/// One-shot timers run by the shell.
#[derive(Clone)]
pub struct Timer<E> {
    context: CapabilityContext<TimerOperation, E>,
}

impl<Ev> Capability<Ev> for Timer<Ev> {
    type Operation = TimerOperation;
    type MappedSelf<MappedEv> = Timer<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        Timer::new(self.context.map_event(f))
    }
}

impl<E> Timer<E>
where
    E: Send + 'static,
{
    pub fn new(context: CapabilityContext<TimerOperation, E>) -> Self {
        Self { context }
    }

    /// Sends `event` back once `millis` have passed.
    pub fn notify_after(&self, millis: u64, event: E) {
        let ctx = self.context.clone();
        self.context.spawn(async move {
            let TimerOutput::Elapsed = ctx
                .request_from_shell(TimerOperation::NotifyAfter { millis })
                .await;
            ctx.update_app(event);
        });
    }
}


#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TimerOperation {
    NotifyAfter { millis: u64 },
}

impl TimerOperation {
    pub fn millis(&self) -> u64 {
        match self {
            TimerOperation::NotifyAfter { millis } => *millis,
        }
    }
}

impl Operation for TimerOperation {
    type Output = TimerOutput;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TimerOutput {
    Elapsed,
}
