//! The record/playback engine.
//!
//! An [`Interposer`] owns one store for one session in one fixed [`Mode`].
//! Recording runs the real call and appends its outcome; playback looks the
//! outcome up by parameter hash and hands it back without running anything.

use crate::call_order::CallOrder;
use crate::canonical::{canonical_identity, parameter_hash, CallIdentity, ParamEncoder, StandardEncoder};
use crate::config::InterposerConfig;
use crate::errors::{CallError, InterposerError};
use crate::hooks::{Hooks, NoHooks};
use crate::logging::{append_run_log, Level};
use crate::store::{FormatVersion, Mode, Outcome, Store};
use crate::wrapper::{Proxy, Target};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub struct InterposerBuilder {
    path: PathBuf,
    mode: Mode,
    encoder: Option<Box<dyn ParamEncoder>>,
    hooks: Option<Arc<dyn Hooks>>,
    config: Option<InterposerConfig>,
}

impl InterposerBuilder {
    pub fn new(path: impl AsRef<Path>, mode: Mode) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            mode,
            encoder: None,
            hooks: None,
            config: None,
        }
    }

    pub fn encoder(mut self, encoder: impl ParamEncoder + 'static) -> Self {
        self.encoder = Some(Box::new(encoder));
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn Hooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn config(mut self, config: InterposerConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> Arc<Interposer> {
        Arc::new(Interposer {
            path: self.path,
            mode: self.mode,
            config: self.config.unwrap_or_default(),
            encoder: self.encoder.unwrap_or_else(|| Box::new(StandardEncoder)),
            hooks: self.hooks.unwrap_or_else(|| Arc::new(NoHooks)),
            state: Mutex::new(DeckState::new(self.mode)),
        })
    }
}

struct DeckState {
    store: Option<Store>,
    format: FormatVersion,
    order: CallOrder,
    /// Outcomes already consumed per hash during this playback session.
    playback_index: HashMap<String, usize>,
    debug_ordinals: BTreeMap<String, usize>,
}

impl DeckState {
    fn new(mode: Mode) -> Self {
        Self {
            store: None,
            // Playback learns the real version from the store at open.
            format: match mode {
                Mode::Recording => FormatVersion::CURRENT,
                Mode::Playback => FormatVersion::LEGACY,
            },
            order: CallOrder::disabled(),
            playback_index: HashMap::new(),
            debug_ordinals: BTreeMap::new(),
        }
    }
}

pub struct Interposer {
    path: PathBuf,
    mode: Mode,
    config: InterposerConfig,
    encoder: Box<dyn ParamEncoder>,
    hooks: Arc<dyn Hooks>,
    state: Mutex<DeckState>,
}

impl Interposer {
    /// An engine with the standard encoder, no hooks, and default config.
    pub fn new(path: impl AsRef<Path>, mode: Mode) -> Arc<Self> {
        InterposerBuilder::new(path, mode).build()
    }

    pub fn builder(path: impl AsRef<Path>, mode: Mode) -> InterposerBuilder {
        InterposerBuilder::new(path, mode)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn hooks(&self) -> &Arc<dyn Hooks> {
        &self.hooks
    }

    /// The format in force: the store's declared version once open.
    pub fn format_version(&self) -> FormatVersion {
        self.state().format
    }

    pub fn is_open(&self) -> bool {
        self.state().store.is_some()
    }

    fn state(&self) -> MutexGuard<'_, DeckState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn open(&self) -> Result<(), InterposerError> {
        let mut state = self.state();
        if state.store.is_some() {
            return Err(InterposerError::AlreadyOpen);
        }
        let store = Store::open(&self.path, self.mode)?;
        let format = store.format_version();
        // A session that never reached close left outcomes but no order log.
        let recorded_order = store.channel_order()?;
        let verify_order = format.tracks_call_order() && !recorded_order.is_empty();
        state.order = CallOrder::new(verify_order, recorded_order);
        state.format = format;
        state.playback_index.clear();
        state.debug_ordinals.clear();
        state.store = Some(store);
        drop(state);

        self.log(
            "fileio",
            "open",
            format!("opened {} for {}", self.path.display(), self.mode.as_str()),
            json!({ "path": self.path.display().to_string(), "format_version": format.get() }),
        );
        Ok(())
    }

    /// Write the call order (when recording) and release the store.
    pub fn close(&self) -> Result<(), InterposerError> {
        let mut state = self.state();
        let DeckState { store, order, .. } = &mut *state;
        let Some(mut open) = store.take() else {
            return Ok(());
        };
        if self.mode == Mode::Recording {
            open.write_channel_order(order.snapshot())?;
        }
        open.close()?;
        drop(state);

        self.log(
            "fileio",
            "close",
            format!("closed {}", self.path.display()),
            json!({ "path": self.path.display().to_string() }),
        );
        Ok(())
    }

    /// Open now and close when the returned guard drops.
    pub fn session(self: &Arc<Self>) -> Result<Session, InterposerError> {
        self.open()?;
        Ok(Session {
            engine: Arc::clone(self),
        })
    }

    pub fn wrappable(&self, target: &Target) -> bool {
        target.is_wrappable()
    }

    pub fn wrap(self: &Arc<Self>, target: Target, channel: &str) -> Result<Proxy, InterposerError> {
        if !self.wrappable(&target) {
            return Err(InterposerError::Wrapping(target.describe()));
        }
        self.log(
            "wrappr",
            "wrap",
            format!("wrapping {} on channel {channel}", target.describe()),
            json!({ "target": target.describe(), "channel": channel }),
        );
        Ok(Proxy::new(target, Arc::downgrade(self), channel))
    }

    /// Run one intercepted call: live and recorded, or played back.
    ///
    /// `live` runs only when recording, and only after the execution veto.
    /// A failure of the live call is recorded and then returned as
    /// [`InterposerError::Call`].
    pub fn intercept<F>(&self, call: CallIdentity, live: F) -> Result<Value, InterposerError>
    where
        F: FnOnce() -> Result<Value, CallError>,
    {
        if !self.is_open() {
            return Err(InterposerError::Closed);
        }
        self.hooks.clear_for_execution(&call)?;
        if self.mode == Mode::Playback {
            return self.playback(&call);
        }

        match live() {
            Ok(result) => {
                let result = self.hooks.cleanup_result_pre(&call, result);
                self.record(&call, Outcome::Result(result.clone()))?;
                Ok(result)
            }
            Err(error) => {
                let error = self.hooks.cleanup_exception_pre(error);
                self.record(&call, Outcome::Exception(error.clone()))?;
                Err(InterposerError::Call(error))
            }
        }
    }

    /// Store `outcome` as the next occurrence of `call`; returns its index.
    pub fn record(&self, call: &CallIdentity, outcome: Outcome) -> Result<usize, InterposerError> {
        if self.mode != Mode::Recording {
            return Err(InterposerError::Playback(
                "cannot record with an engine opened for playback".to_string(),
            ));
        }
        let call = self.hooks.cleanup_parameters_pre(call.clone());

        let mut state = self.state();
        let format = state.format;
        let canonical = canonical_identity(&call, format, self.encoder.as_ref())?;
        let hash = parameter_hash(&canonical)?;
        self.dump_call(&mut state, "record", &call.channel, &canonical)?;
        let store = state.store.as_ref().ok_or(InterposerError::Closed)?;
        let index = store.append(&hash, &outcome)?;
        state.order.note_recorded(&call.channel, canonical.clone());
        drop(state);

        let (category, label, shown) = match &outcome {
            Outcome::Result(result) => ("result", "RESULT", result.clone()),
            Outcome::Exception(error) => ("except", "EXCEPTION", Value::String(error.to_string())),
        };
        self.log(
            category,
            "recorded",
            format!("recording {label} {hash} call #{index} for params {canonical}: {shown}"),
            json!({ "hash": hash, "index": index, "params": canonical, "outcome": shown }),
        );
        self.log(
            "params",
            "recorded",
            format!("params for {hash}: {canonical}"),
            json!({ "hash": hash, "params": canonical }),
        );
        Ok(index)
    }

    /// Hand back the next recorded outcome for `call`.
    ///
    /// A recorded exception comes back as `Err(InterposerError::Call(..))`.
    pub fn playback(&self, call: &CallIdentity) -> Result<Value, InterposerError> {
        if self.mode != Mode::Playback {
            return Err(InterposerError::Playback(
                "cannot play back with an engine opened for recording".to_string(),
            ));
        }
        let call = self.hooks.cleanup_parameters_post(call.clone());

        let mut state = self.state();
        let format = state.format;
        let canonical = canonical_identity(&call, format, self.encoder.as_ref())?;
        let hash = parameter_hash(&canonical)?;
        self.dump_call(&mut state, "playback", &call.channel, &canonical)?;
        if state.store.is_none() {
            return Err(InterposerError::Closed);
        }

        // Order is checked before any outcome is read.
        state.order.verify_playback(&call.channel, &canonical)?;
        let store = state.store.as_ref().ok_or(InterposerError::Closed)?;
        let outcomes = store.get(&hash)?.ok_or_else(|| {
            InterposerError::Playback(format!(
                "no calls recorded for these parameters: {canonical} (hash {hash})"
            ))
        })?;
        let index = state.playback_index.get(&hash).copied().unwrap_or(0);
        let Some(outcome) = outcomes.into_iter().nth(index) else {
            return Err(InterposerError::Playback(format!(
                "call {index} never recorded for parameters {canonical} (hash {hash})"
            )));
        };
        state.playback_index.insert(hash.clone(), index + 1);
        drop(state);

        self.log(
            "params",
            "playback",
            format!("params for {hash}: {canonical}"),
            json!({ "hash": hash, "params": canonical }),
        );
        match outcome {
            Outcome::Result(result) => {
                self.log(
                    "result",
                    "playback",
                    format!("playing back RESULT for {hash} call #{index}: {result}"),
                    json!({ "hash": hash, "index": index, "result": result }),
                );
                Ok(self.hooks.cleanup_result_post(result))
            }
            Outcome::Exception(error) => {
                self.log(
                    "except",
                    "playback",
                    format!("playing back EXCEPTION for {hash} call #{index}: {error}"),
                    json!({ "hash": hash, "index": index, "exception": error.to_string() }),
                );
                Err(InterposerError::Call(self.hooks.cleanup_exception_post(error)))
            }
        }
    }

    /// Calls actually played back on `channel` so far, in order.
    pub fn played_back(&self, channel: &str) -> Vec<Value> {
        self.state().order.played_back(channel).to_vec()
    }

    pub(crate) fn log(&self, category: &str, subcategory: &str, message: String, payload: Value) {
        let logging = &self.config.logging;
        let level = logging.level_for(category, subcategory);
        if !logging.enabled(level) {
            return;
        }
        append_run_log(
            level,
            &format!("tape.{category}.{subcategory}"),
            json!({ "message": format!("{}{message}", logging.prefix), "detail": payload }),
        );
    }

    fn dump_call(
        &self,
        state: &mut DeckState,
        phase: &str,
        channel: &str,
        canonical: &Value,
    ) -> Result<(), InterposerError> {
        let Some(dir) = &self.config.debug.calls_dir else {
            return Ok(());
        };
        let channel = channel
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect::<String>();
        let key = format!("{phase}-{channel}");
        let ordinal = state.debug_ordinals.entry(key.clone()).or_insert(0);
        let path = dir.join(format!("{key}-{ordinal}.json"));
        *ordinal += 1;

        std::fs::create_dir_all(dir).map_err(|e| InterposerError::Io(e.to_string()))?;
        let text = serde_json::to_string_pretty(canonical)
            .map_err(|e| InterposerError::Io(e.to_string()))?;
        std::fs::write(&path, text).map_err(|e| InterposerError::Io(e.to_string()))
    }
}

impl Drop for Interposer {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            append_run_log(
                Level::Error,
                "tape.fileio.close_failed",
                json!({ "path": self.path.display().to_string(), "error": error.to_string() }),
            );
        }
    }
}

/// An open engine that closes itself when dropped.
pub struct Session {
    engine: Arc<Interposer>,
}

impl Session {
    pub fn engine(&self) -> &Arc<Interposer> {
        &self.engine
    }

    /// Close now and surface any error instead of logging it.
    pub fn close(self) -> Result<(), InterposerError> {
        self.engine.close()
    }
}

impl Deref for Session {
    type Target = Arc<Interposer>;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(error) = self.engine.close() {
            append_run_log(
                Level::Error,
                "tape.fileio.close_failed",
                json!({ "path": self.engine.path.display().to_string(), "error": error.to_string() }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Interposer;
    use crate::canonical::{canonical_identity, parameter_hash, Arguments, CallIdentity, StandardEncoder};
    use crate::config::InterposerConfig;
    use crate::errors::{CallError, InterposerError};
    use crate::store::{FormatVersion, Mode, Outcome, Store};
    use serde_json::json;

    fn fetch(id: i64) -> CallIdentity {
        CallIdentity::new("fetch", &Arguments::new().kwarg("id", id), "default")
    }

    #[test]
    fn recorded_outcomes_play_back_in_order_then_run_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("deck.db");

        let recorder = Interposer::new(&path, Mode::Recording);
        recorder.open().expect("open");
        recorder.record(&fetch(1), Outcome::Result(json!({"name": "a"}))).expect("a");
        recorder.record(&fetch(1), Outcome::Result(json!({"name": "b"}))).expect("b");
        recorder.close().expect("close");

        let player = Interposer::new(&path, Mode::Playback);
        player.open().expect("open");
        assert_eq!(player.format_version(), FormatVersion::CURRENT);
        assert_eq!(player.playback(&fetch(1)).expect("first"), json!({"name": "a"}));
        assert_eq!(player.playback(&fetch(1)).expect("second"), json!({"name": "b"}));
        let err = player.playback(&fetch(1)).expect_err("third");
        assert!(matches!(err, InterposerError::Playback(_)));
    }

    #[test]
    fn unknown_parameters_are_a_playback_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("deck.db");
        let recorder = Interposer::new(&path, Mode::Recording);
        recorder.open().expect("open");
        recorder.record(&fetch(1), Outcome::Result(json!(1))).expect("record");
        recorder.close().expect("close");

        let player = Interposer::new(&path, Mode::Playback);
        player.open().expect("open");
        // The order log sees the divergence before any outcome is read.
        let err = player.playback(&fetch(2)).expect_err("unknown");
        assert!(matches!(err, InterposerError::Playback(_)));
    }

    #[test]
    fn outcomes_without_an_order_log_still_play_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("interrupted.db");
        let canonical = canonical_identity(&fetch(1), FormatVersion::CURRENT, &StandardEncoder)
            .expect("canonical");
        let hash = parameter_hash(&canonical).expect("hash");
        // Outcomes appended but the session never closed, so no order was written.
        let mut store = Store::open(&path, Mode::Recording).expect("create");
        store.append(&hash, &Outcome::Result(json!({"name": "a"}))).expect("append");
        store.close().expect("close");

        let player = Interposer::new(&path, Mode::Playback);
        player.open().expect("open");
        assert_eq!(player.playback(&fetch(1)).expect("replay"), json!({"name": "a"}));
        assert_eq!(player.played_back("default").len(), 1);
    }

    #[test]
    fn recorded_exceptions_come_back_as_call_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("deck.db");
        let recorder = Interposer::new(&path, Mode::Recording);
        recorder.open().expect("open");
        let err = recorder
            .intercept(fetch(9), || Err(CallError::new("NotFound", "id 9")))
            .expect_err("live failure");
        assert_eq!(err.as_call().map(|e| e.kind.as_str()), Some("NotFound"));
        recorder.close().expect("close");

        let player = Interposer::new(&path, Mode::Playback);
        player.open().expect("open");
        let err = player
            .intercept(fetch(9), || panic!("live call during playback"))
            .expect_err("replayed failure");
        assert_eq!(err.as_call(), Some(&CallError::new("NotFound", "id 9")));
    }

    #[test]
    fn lifecycle_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("deck.db");
        let engine = Interposer::new(&path, Mode::Recording);
        assert!(matches!(
            engine.record(&fetch(1), Outcome::Result(json!(1))),
            Err(InterposerError::Closed)
        ));
        engine.open().expect("open");
        assert!(matches!(engine.open(), Err(InterposerError::AlreadyOpen)));
        assert!(matches!(engine.playback(&fetch(1)), Err(InterposerError::Playback(_))));
        engine.close().expect("close");
        engine.close().expect("idempotent");
    }

    #[test]
    fn session_guard_closes_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("deck.db");
        let engine = Interposer::new(&path, Mode::Recording);
        {
            let session = engine.session().expect("session");
            session.record(&fetch(3), Outcome::Result(json!(3))).expect("record");
            assert!(engine.is_open());
        }
        assert!(!engine.is_open());
        engine.session().expect("reopen").close().expect("close");
    }

    #[test]
    fn debug_dir_receives_each_hashed_identity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let calls = dir.path().join("calls");
        let mut config = InterposerConfig::default();
        config.debug.calls_dir = Some(calls.clone());
        let engine = Interposer::builder(dir.path().join("deck.db"), Mode::Recording)
            .config(config)
            .build();
        engine.open().expect("open");
        engine.record(&fetch(1), Outcome::Result(json!(1))).expect("record");
        engine.record(&fetch(1), Outcome::Result(json!(2))).expect("record");
        engine.close().expect("close");

        let text = std::fs::read_to_string(calls.join("record-default-1.json")).expect("dump");
        let value: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["method"], "fetch");
        assert_eq!(value["kwargs"]["id"], 1);
    }
}
