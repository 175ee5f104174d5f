//! Spoken input source
//!
//! Sits on top of the provisioning engine and drives the actual
//! listening session: it makes sure a model is on disk, constructs the
//! recognition engine off the foreground context, routes streaming
//! recognition events into the input contract, and keeps the
//! presentation state machine honest through loads, cancellations and
//! teardown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::speech::{SpeechState, SpeechStateObserver, StateTracker};
use super::{InputListener, InputSource, ListenerSlot};
use crate::provision::{ModelProvisioningEngine, ProvisionEvent, ProvisionOutcome};
use crate::recognizer::{
    self, MICROPHONE_BUSY_MESSAGE, RecognitionEvent, RecognizerFactory, SpeechRecognizer,
};
use crate::Error;

struct Session {
    recognizer: Option<Box<dyn SpeechRecognizer>>,
    initializing: bool,
    start_on_loaded: bool,
    listening: bool,
    tracker: StateTracker,
}

impl Session {
    fn new() -> Self {
        Self {
            recognizer: None,
            initializing: false,
            start_on_loaded: false,
            listening: false,
            tracker: StateTracker::new(),
        }
    }

    /// End the listening session and settle the visible state
    fn stop_listening(&mut self) {
        self.listening = false;
        if let Some(recognizer) = &self.recognizer {
            recognizer.stop();
        }
        self.tracker.show(SpeechState::Idle);
    }
}

struct Inner {
    session: Mutex<Session>,
    listener: ListenerSlot,
    provisioner: Arc<ModelProvisioningEngine>,
    factory: Arc<dyn RecognizerFactory>,
    sample_rate: f32,
    /// Bumped on cleanup; background work from an older generation
    /// discards its result instead of touching the session
    generation: AtomicU64,
}

impl Inner {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Speech-driven input source.
///
/// All public operations return quickly; model downloads, recognizer
/// construction and archive extraction run in the background and report
/// back through the registered [`InputListener`] and the presentation
/// state machine.
pub struct VoiceInputSource {
    inner: Arc<Inner>,
}

impl VoiceInputSource {
    /// Create a voice input source on top of a provisioning engine.
    ///
    /// `provision_events` must be the receiver returned by
    /// [`ModelProvisioningEngine::new`] for the same engine. Must be
    /// called within a tokio runtime.
    #[must_use]
    pub fn new(
        provisioner: Arc<ModelProvisioningEngine>,
        provision_events: mpsc::UnboundedReceiver<ProvisionEvent>,
        factory: Arc<dyn RecognizerFactory>,
        sample_rate: f32,
    ) -> Self {
        let inner = Arc::new(Inner {
            session: Mutex::new(Session::new()),
            listener: ListenerSlot::new(),
            provisioner,
            factory,
            sample_rate,
            generation: AtomicU64::new(0),
        });

        tokio::spawn(Self::pump_provision_events(
            Arc::downgrade(&inner),
            provision_events,
        ));

        Self { inner }
    }

    /// Attach, replace or detach the presentation surface. A newly
    /// attached observer immediately receives the current state.
    pub fn set_state_observer(&self, observer: Option<Box<dyn SpeechStateObserver>>) {
        self.inner.session().tracker.set_observer(observer);
    }

    /// The current presentation state
    #[must_use]
    pub fn state(&self) -> SpeechState {
        self.inner.session().tracker.current()
    }

    async fn pump_provision_events(
        inner: std::sync::Weak<Inner>,
        mut events: mpsc::UnboundedReceiver<ProvisionEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let Some(inner) = inner.upgrade() else { break };
            match event {
                ProvisionEvent::ModelReady => {
                    Self::load_inner(&inner, false).await;
                }
                ProvisionEvent::Failed(error) => {
                    inner.listener.notify_error(&error);
                    inner.session().tracker.show(SpeechState::RequiresDownload);
                }
            }
        }
    }

    /// Prepare the recognizer, provisioning the model first if needed.
    async fn load_inner(inner: &Arc<Inner>, manual: bool) {
        let initialize = {
            let mut session = inner.session();
            if session.recognizer.is_some() || session.initializing {
                return;
            }
            if inner.provisioner.model_ready() {
                session.initializing = true;
                session.tracker.show(SpeechState::Loading);
                true
            } else {
                false
            }
        };

        if initialize {
            tracing::debug!("model in place, initializing recognizer");

            let generation = inner.generation.load(Ordering::SeqCst);
            let task_inner = Arc::clone(inner);
            tokio::spawn(async move {
                let factory = Arc::clone(&task_inner.factory);
                let model_dir = task_inner.provisioner.model_dir().to_path_buf();
                let sample_rate = task_inner.sample_rate;

                let built =
                    tokio::task::spawn_blocking(move || factory.create(&model_dir, sample_rate))
                        .await
                        .unwrap_or_else(|e| {
                            Err(Error::Engine(format!("recognizer construction failed: {e}")))
                        });

                if task_inner.generation.load(Ordering::SeqCst) != generation {
                    // the source was cleaned up while we were building
                    if let Ok(recognizer) = built {
                        recognizer.shutdown();
                    }
                    return;
                }

                let start = {
                    let mut session = task_inner.session();
                    session.initializing = false;
                    match built {
                        Ok(recognizer) => {
                            session.recognizer = Some(recognizer);
                            if session.start_on_loaded {
                                session.start_on_loaded = false;
                                true
                            } else {
                                session.tracker.show(SpeechState::Idle);
                                false
                            }
                        }
                        Err(error) => {
                            let error = classify_construction_error(error);
                            session.tracker.show(SpeechState::Idle);
                            drop(session);
                            task_inner.listener.notify_error(&error);
                            false
                        }
                    }
                };

                if start {
                    Self::begin_listening(&task_inner);
                }
            });
        } else {
            if manual {
                inner.session().tracker.show(SpeechState::Loading);
            }
            match inner.provisioner.request_provisioning(manual).await {
                Ok(ProvisionOutcome::Started | ProvisionOutcome::Ready) => {}
                Ok(ProvisionOutcome::AlreadyDownloading) => {
                    tracing::debug!("model already being downloaded");
                }
                Ok(ProvisionOutcome::DownloadRequired) => {
                    inner.session().tracker.show(SpeechState::RequiresDownload);
                }
                Err(error) => {
                    inner.listener.notify_error(&error);
                    inner.session().tracker.show(SpeechState::RequiresDownload);
                }
            }
        }
    }

    /// Mark listening active and start a streaming session. The session
    /// lock is held throughout, so a concurrent cancel or trigger either
    /// runs entirely before or entirely after the session starts.
    fn begin_listening(inner: &Arc<Inner>) {
        let events_rx = {
            let mut session = inner.session();
            if session.listening || session.recognizer.is_none() {
                return;
            }
            session.listening = true;
            inner.listener.notify_trying_to_get_input();

            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let started = match session.recognizer.as_ref() {
                Some(recognizer) => recognizer.start_listening(events_tx),
                None => return,
            };

            if let Err(error) = started {
                session.listening = false;
                session.tracker.show(SpeechState::Idle);
                inner.listener.notify_error(&error);
                return;
            }

            tracing::debug!("recognizer listening");
            session.tracker.show(SpeechState::Listening);
            events_rx
        };

        let generation = inner.generation.load(Ordering::SeqCst);
        let task_inner = Arc::clone(inner);
        tokio::spawn(Self::route_recognition_events(
            task_inner,
            events_rx,
            generation,
        ));
    }

    async fn route_recognition_events(
        inner: Arc<Inner>,
        mut events: mpsc::UnboundedReceiver<RecognitionEvent>,
        generation: u64,
    ) {
        while let Some(event) = events.recv().await {
            if inner.generation.load(Ordering::SeqCst) != generation {
                break;
            }

            match event {
                RecognitionEvent::Partial(payload) => {
                    // late partials after a stop are discarded
                    if !inner.session().listening {
                        continue;
                    }
                    if let Some(partial) = recognizer::parse_partial(&payload) {
                        inner.listener.notify_partial_input(&partial);
                    }
                }
                RecognitionEvent::Final(payload) => {
                    {
                        let mut session = inner.session();
                        if !session.listening {
                            continue;
                        }
                        // stop first, so parsing cannot re-enter a live session
                        session.stop_listening();
                    }
                    let inputs = recognizer::parse_alternatives(&payload);
                    if inputs.is_empty() {
                        inner.listener.notify_no_input_received();
                    } else {
                        inner.listener.notify_input_received(inputs);
                    }
                }
                RecognitionEvent::Timeout => {
                    inner.session().stop_listening();
                    inner.listener.notify_no_input_received();
                }
                RecognitionEvent::Error(message) => {
                    inner.session().stop_listening();
                    inner.listener.notify_error(&Error::Engine(message));
                }
            }
        }
    }
}

/// Map the recognizer's known recorder failure onto the distinct
/// microphone error so the presentation layer can explain it.
fn classify_construction_error(error: Error) -> Error {
    match error {
        Error::Engine(message) if message == MICROPHONE_BUSY_MESSAGE => {
            Error::MicrophoneUnavailable(message)
        }
        other => other,
    }
}

#[async_trait]
impl InputSource for VoiceInputSource {
    fn set_listener(&self, listener: Box<dyn InputListener>) {
        self.inner.listener.set(listener);
    }

    fn clear_listener(&self) {
        self.inner.listener.clear();
    }

    async fn load(&self) {
        // not user-triggered, so a missing model must not start a download
        Self::load_inner(&self.inner, false).await;
    }

    async fn try_to_get_input(&self, manual: bool) {
        let needs_load = {
            let mut session = self.inner.session();
            if session.initializing {
                // start as soon as loading finishes
                session.start_on_loaded = true;
                return;
            }
            if session.recognizer.is_none() {
                session.start_on_loaded = true;
                true
            } else if session.listening {
                // already listening; a second trigger is a no-op
                return;
            } else {
                false
            }
        };

        if needs_load {
            Self::load_inner(&self.inner, manual).await;
        } else {
            Self::begin_listening(&self.inner);
        }
    }

    async fn cancel_getting_input(&self) {
        let mut session = self.inner.session();
        if session.listening {
            if let Some(recognizer) = &session.recognizer {
                recognizer.stop();
            }
            self.inner.listener.notify_no_input_received();
            // settle the visible state only because a session was
            // actually interrupted; a Loading (or other non-listening)
            // state is never clobbered to Idle by a cancel that did not
            // interrupt anything
            session.tracker.show(SpeechState::Idle);
        }
        session.listening = false;
        session.start_on_loaded = false;
    }

    async fn cleanup(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);

        {
            let mut session = self.inner.session();
            if let Some(recognizer) = session.recognizer.take() {
                recognizer.shutdown();
            }
            session.initializing = false;
            session.start_on_loaded = false;
            session.listening = false;
            session.tracker.reset();
        }

        self.inner.listener.clear();
        self.inner.provisioner.cleanup().await;
    }
}

#[cfg(test)]
mod tests {
    use super::super::speech::testing::RecordingObserver;
    use super::super::testing::{Observed, RecordingListener};
    use super::*;
    use crate::config::Config;
    use crate::provision::testing::ScriptedRegistry;
    use crate::provision::MemoryStore;
    use crate::Result;

    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct MockRecognizer {
        shared: Arc<MockShared>,
    }

    #[derive(Default)]
    struct MockShared {
        events: Mutex<Option<mpsc::UnboundedSender<RecognitionEvent>>>,
        starts: AtomicUsize,
        stops: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    impl MockShared {
        fn send(&self, event: RecognitionEvent) {
            if let Some(sender) = self.events.lock().unwrap().as_ref() {
                let _ = sender.send(event);
            }
        }

        fn start_count(&self) -> usize {
            self.starts.load(Ordering::SeqCst)
        }
    }

    impl SpeechRecognizer for MockRecognizer {
        fn start_listening(
            &self,
            events: mpsc::UnboundedSender<RecognitionEvent>,
        ) -> Result<()> {
            self.shared.starts.fetch_add(1, Ordering::SeqCst);
            *self.shared.events.lock().unwrap() = Some(events);
            Ok(())
        }

        fn stop(&self) {
            self.shared.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn shutdown(&self) {
            self.shared.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct MockFactory {
        shared: Arc<MockShared>,
        fail_with: Mutex<Option<Error>>,
    }

    impl MockFactory {
        fn new(shared: Arc<MockShared>) -> Self {
            Self {
                shared,
                fail_with: Mutex::new(None),
            }
        }
    }

    impl RecognizerFactory for MockFactory {
        fn create(&self, _model_dir: &Path, _sample_rate: f32) -> Result<Box<dyn SpeechRecognizer>> {
            if let Some(error) = self.fail_with.lock().unwrap().take() {
                return Err(error);
            }
            Ok(Box::new(MockRecognizer {
                shared: Arc::clone(&self.shared),
            }))
        }
    }

    struct Fixture {
        source: VoiceInputSource,
        listener: RecordingListener,
        observer: RecordingObserver,
        shared: Arc<MockShared>,
        registry: Arc<ScriptedRegistry>,
        _dir: tempfile::TempDir,
    }

    fn fixture_with(model_present: bool, factory_error: Option<Error>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        config.model.preferred_locales = vec!["en-US".to_string()];

        if model_present {
            std::fs::create_dir_all(config.model_dir().join("ivector")).unwrap();
        }

        let registry = Arc::new(ScriptedRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let (provisioner, events) =
            crate::provision::ModelProvisioningEngine::new(registry.clone(), store, &config);

        let shared = Arc::new(MockShared::default());
        let factory = MockFactory::new(Arc::clone(&shared));
        *factory.fail_with.lock().unwrap() = factory_error;

        let source = VoiceInputSource::new(provisioner, events, Arc::new(factory), 44100.0);

        let listener = RecordingListener::new();
        source.set_listener(Box::new(listener.clone()));
        let observer = RecordingObserver::new();
        source.set_state_observer(Some(Box::new(observer.clone())));

        Fixture {
            source,
            listener,
            observer,
            shared,
            registry,
            _dir: dir,
        }
    }

    async fn wait_until(what: &str, condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn try_to_get_input_starts_listening() {
        let fixture = fixture_with(true, None);

        fixture.source.try_to_get_input(true).await;
        wait_until("listening", || {
            fixture.source.state() == SpeechState::Listening
        })
        .await;

        assert_eq!(fixture.shared.start_count(), 1);
        assert_eq!(fixture.listener.count(|o| *o == Observed::Trying), 1);
        assert_eq!(
            fixture.observer.states(),
            vec![
                SpeechState::Idle,
                SpeechState::Loading,
                SpeechState::Listening,
            ]
        );
    }

    #[tokio::test]
    async fn second_trigger_while_listening_is_a_no_op() {
        let fixture = fixture_with(true, None);

        fixture.source.try_to_get_input(true).await;
        wait_until("listening", || {
            fixture.source.state() == SpeechState::Listening
        })
        .await;
        fixture.source.try_to_get_input(true).await;
        fixture.source.try_to_get_input(true).await;

        assert_eq!(fixture.shared.start_count(), 1);
        assert_eq!(fixture.listener.count(|o| *o == Observed::Trying), 1);
    }

    #[tokio::test]
    async fn final_result_stops_and_forwards_alternatives() {
        let fixture = fixture_with(true, None);

        fixture.source.try_to_get_input(true).await;
        wait_until("listening", || {
            fixture.source.state() == SpeechState::Listening
        })
        .await;

        fixture.shared.send(RecognitionEvent::Partial(
            r#"{"partial": "switch"}"#.to_string(),
        ));
        fixture.shared.send(RecognitionEvent::Final(
            r#"{"alternatives": [{"text": "switch on the lights"}, {"text": "switch on"}]}"#
                .to_string(),
        ));

        wait_until("final input", || {
            fixture
                .listener
                .count(|o| matches!(o, Observed::Input(_)))
                == 1
        })
        .await;

        assert_eq!(fixture.source.state(), SpeechState::Idle);
        assert_eq!(
            fixture.listener.observed(),
            vec![
                Observed::Trying,
                Observed::Partial("switch".to_string()),
                Observed::Input(vec![
                    "switch on the lights".to_string(),
                    "switch on".to_string(),
                ]),
            ]
        );
    }

    #[tokio::test]
    async fn empty_final_result_is_no_input() {
        let fixture = fixture_with(true, None);

        fixture.source.try_to_get_input(true).await;
        wait_until("listening", || {
            fixture.source.state() == SpeechState::Listening
        })
        .await;

        fixture
            .shared
            .send(RecognitionEvent::Final(r#"{"alternatives": []}"#.to_string()));

        wait_until("no-input", || {
            fixture.listener.count(|o| *o == Observed::NoInput) == 1
        })
        .await;
        assert_eq!(fixture.source.state(), SpeechState::Idle);
    }

    #[tokio::test]
    async fn timeout_is_no_input() {
        let fixture = fixture_with(true, None);

        fixture.source.try_to_get_input(true).await;
        wait_until("listening", || {
            fixture.source.state() == SpeechState::Listening
        })
        .await;

        fixture.shared.send(RecognitionEvent::Timeout);
        wait_until("no-input", || {
            fixture.listener.count(|o| *o == Observed::NoInput) == 1
        })
        .await;
        assert_eq!(fixture.source.state(), SpeechState::Idle);
    }

    #[tokio::test]
    async fn engine_error_stops_and_notifies() {
        let fixture = fixture_with(true, None);

        fixture.source.try_to_get_input(true).await;
        wait_until("listening", || {
            fixture.source.state() == SpeechState::Listening
        })
        .await;

        fixture
            .shared
            .send(RecognitionEvent::Error("decoder died".to_string()));
        wait_until("error", || {
            fixture
                .listener
                .count(|o| matches!(o, Observed::Error(_)))
                == 1
        })
        .await;
        assert_eq!(fixture.source.state(), SpeechState::Idle);
    }

    #[tokio::test]
    async fn cancel_while_listening_reports_no_input() {
        let fixture = fixture_with(true, None);

        fixture.source.try_to_get_input(true).await;
        wait_until("listening", || {
            fixture.source.state() == SpeechState::Listening
        })
        .await;

        fixture.source.cancel_getting_input().await;

        assert_eq!(fixture.listener.count(|o| *o == Observed::NoInput), 1);
        assert_eq!(fixture.source.state(), SpeechState::Idle);

        // late partials after the cancel are discarded
        fixture.shared.send(RecognitionEvent::Partial(
            r#"{"partial": "ghost"}"#.to_string(),
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            fixture
                .listener
                .count(|o| matches!(o, Observed::Partial(_))),
            0
        );
    }

    #[tokio::test]
    async fn cancel_while_not_listening_is_silent() {
        let fixture = fixture_with(true, None);

        fixture.source.load().await;
        wait_until("idle after load", || {
            fixture.observer.states()
                == vec![SpeechState::Idle, SpeechState::Loading, SpeechState::Idle]
        })
        .await;

        fixture.source.cancel_getting_input().await;

        assert_eq!(fixture.listener.count(|o| *o == Observed::NoInput), 0);
        assert_eq!(
            fixture.observer.states(),
            vec![SpeechState::Idle, SpeechState::Loading, SpeechState::Idle]
        );
    }

    #[tokio::test]
    async fn trigger_during_initialization_starts_when_loaded() {
        let fixture = fixture_with(true, None);

        // first trigger kicks off loading; the recognizer is not ready yet
        fixture.source.try_to_get_input(true).await;
        fixture.source.try_to_get_input(true).await;

        wait_until("listening", || {
            fixture.source.state() == SpeechState::Listening
        })
        .await;
        assert_eq!(fixture.shared.start_count(), 1);
        assert_eq!(fixture.listener.count(|o| *o == Observed::Trying), 1);
    }

    #[tokio::test]
    async fn missing_model_without_intent_requires_download() {
        let fixture = fixture_with(false, None);

        fixture.source.try_to_get_input(false).await;
        wait_until("requires download", || {
            fixture.source.state() == SpeechState::RequiresDownload
        })
        .await;

        assert_eq!(fixture.registry.enqueue_count(), 0);
        assert_eq!(fixture.listener.count(|o| *o == Observed::Trying), 0);
    }

    #[tokio::test]
    async fn manual_trigger_with_missing_model_starts_download() {
        let fixture = fixture_with(false, None);

        fixture.source.try_to_get_input(true).await;
        wait_until("download enqueued", || fixture.registry.enqueue_count() == 1).await;
        assert_eq!(fixture.source.state(), SpeechState::Loading);
    }

    #[tokio::test]
    async fn microphone_failure_is_classified() {
        let fixture = fixture_with(
            true,
            Some(Error::Engine(MICROPHONE_BUSY_MESSAGE.to_string())),
        );

        fixture.source.load().await;
        wait_until("error", || {
            fixture
                .listener
                .count(|o| matches!(o, Observed::Error(_)))
                == 1
        })
        .await;

        let observed = fixture.listener.observed();
        match observed.first() {
            Some(Observed::Error(message)) => {
                assert!(message.starts_with("microphone unavailable"));
            }
            other => panic!("unexpected observation: {other:?}"),
        }
        assert_eq!(fixture.source.state(), SpeechState::Idle);
    }

    #[tokio::test]
    async fn cleanup_releases_recognizer_and_discards_late_events() {
        let fixture = fixture_with(true, None);

        fixture.source.try_to_get_input(true).await;
        wait_until("listening", || {
            fixture.source.state() == SpeechState::Listening
        })
        .await;

        fixture.source.cleanup().await;
        assert_eq!(fixture.shared.shutdowns.load(Ordering::SeqCst), 1);

        // events from the torn-down session are discarded
        fixture.shared.send(RecognitionEvent::Final(
            r#"{"alternatives": [{"text": "too late"}]}"#.to_string(),
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            fixture.listener.count(|o| matches!(o, Observed::Input(_))),
            0
        );

        // idempotent
        fixture.source.cleanup().await;
    }
}
