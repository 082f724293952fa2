//! A stand-in shell for driving [`App`] in tests.
//!
//! Storage requests are answered from a real [`MessageStore`] and
//! classifications from a [`Classifier`]. Either can be held back to open a
//! window where the core has a request in flight. Timers only fire when the
//! test says so.

use std::collections::VecDeque;
use std::sync::Arc;

use crux_core::capability::Operation;
use crux_core::testing::AppTester;
use crux_core::App as _;
use crux_core::Request;
use tracing::warn;

use crate::app::{App, Model};
use crate::capabilities::{
    moderation, storage, Classifier, Effect, ModerationOperation, StorageOperation,
    TimerOperation, TimerOutput, ViewportOperation,
};
use crate::event::{Event, ScrollRequest};
use crate::offline_store::MessageStore;
use crate::session::ChatViewModel;

type Followups = (Vec<Effect>, Vec<Event>);

pub struct TestShell<S, C> {
    app: AppTester<App, Effect>,
    model: Model,
    store: Arc<S>,
    classifier: C,
    hold_writes: bool,
    hold_classifications: bool,
    held_writes: Vec<Request<StorageOperation>>,
    held_classifications: Vec<Request<ModerationOperation>>,
    timers: Vec<Request<TimerOperation>>,
    scrolls: Vec<ScrollRequest>,
    renders: usize,
}

impl<S: MessageStore, C: Classifier> TestShell<S, C> {
    pub fn new(model: Model, store: Arc<S>, classifier: C) -> Self {
        Self {
            app: AppTester::default(),
            model,
            store,
            classifier,
            hold_writes: false,
            hold_classifications: false,
            held_writes: Vec::new(),
            held_classifications: Vec::new(),
            timers: Vec::new(),
            scrolls: Vec::new(),
            renders: 0,
        }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn classifier(&self) -> &C {
        &self.classifier
    }

    pub fn view(&self) -> ChatViewModel {
        App::default().view(&self.model)
    }

    /// Dispatches `event` and keeps answering effects until the core is idle.
    pub async fn send(&mut self, event: Event) {
        self.settle(Vec::new(), vec![event]).await;
    }

    /// Parks store writes and clears until [`Self::release_writes`].
    pub fn hold_writes(&mut self) {
        self.hold_writes = true;
    }

    pub async fn release_writes(&mut self) {
        self.hold_writes = false;
        for mut request in std::mem::take(&mut self.held_writes) {
            let output = storage::serve(self.store.as_ref(), request.operation.clone()).await;
            let followups = self.resolve(&mut request, output);
            self.settle(followups.0, followups.1).await;
        }
    }

    pub fn hold_classifications(&mut self) {
        self.hold_classifications = true;
    }

    pub fn held_classifications(&self) -> usize {
        self.held_classifications.len()
    }

    pub async fn release_classifications(&mut self) {
        self.hold_classifications = false;
        for mut request in std::mem::take(&mut self.held_classifications) {
            let output = moderation::serve(&self.classifier, request.operation.clone()).await;
            let followups = self.resolve(&mut request, output);
            self.settle(followups.0, followups.1).await;
        }
    }

    /// Durations of the timers armed and not yet fired, in arming order.
    pub fn pending_timers(&self) -> Vec<u64> {
        self.timers.iter().map(|t| t.operation.millis()).collect()
    }

    /// Fires every pending timer of `millis`; returns how many fired.
    pub async fn fire_timers(&mut self, millis: u64) -> usize {
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.timers)
            .into_iter()
            .partition(|t| t.operation.millis() == millis);
        self.timers = waiting;

        let fired = due.len();
        for mut request in due {
            let followups = self.resolve(&mut request, TimerOutput::Elapsed);
            self.settle(followups.0, followups.1).await;
        }
        fired
    }

    pub fn take_scrolls(&mut self) -> Vec<ScrollRequest> {
        std::mem::take(&mut self.scrolls)
    }

    pub fn renders(&self) -> usize {
        self.renders
    }

    async fn settle(&mut self, effects: Vec<Effect>, events: Vec<Event>) {
        let mut effects: VecDeque<Effect> = effects.into();
        let mut events: VecDeque<Event> = events.into();
        loop {
            if let Some(event) = events.pop_front() {
                let update = self.app.update(event, &mut self.model);
                effects.extend(update.effects);
                events.extend(update.events);
                continue;
            }
            let Some(effect) = effects.pop_front() else {
                break;
            };
            let (more_effects, more_events) = self.handle(effect).await;
            effects.extend(more_effects);
            events.extend(more_events);
        }
    }

    async fn handle(&mut self, effect: Effect) -> Followups {
        match effect {
            Effect::Render(_) => {
                self.renders += 1;
                (Vec::new(), Vec::new())
            }
            Effect::Storage(mut request) => {
                if self.hold_writes && !matches!(request.operation, StorageOperation::GetAllByTime) {
                    self.held_writes.push(request);
                    return (Vec::new(), Vec::new());
                }
                let output = storage::serve(self.store.as_ref(), request.operation.clone()).await;
                self.resolve(&mut request, output)
            }
            Effect::Moderation(mut request) => {
                if self.hold_classifications {
                    self.held_classifications.push(request);
                    return (Vec::new(), Vec::new());
                }
                let output = moderation::serve(&self.classifier, request.operation.clone()).await;
                self.resolve(&mut request, output)
            }
            Effect::Timer(request) => {
                self.timers.push(request);
                (Vec::new(), Vec::new())
            }
            Effect::Viewport(request) => {
                let ViewportOperation::ScrollTo(scroll) = request.operation;
                self.scrolls.push(scroll);
                (Vec::new(), Vec::new())
            }
        }
    }

    fn resolve<Op: Operation>(&self, request: &mut Request<Op>, output: Op::Output) -> Followups {
        match self.app.resolve(request, output) {
            Ok(update) => (update.effects, update.events),
            Err(e) => {
                warn!(error = %e, "request could not be resolved");
                (Vec::new(), Vec::new())
            }
        }
    }
}
