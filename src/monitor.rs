//! The polling loop: one actor task that owns cycle execution, plus a
//! cloneable handle that feeds it traffic, navigation and UI events.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::Marketplace;
use crate::auth::{self, Credential};
use crate::browser::{
    AlertSink, BrowserEvent, Reauthenticator, StatusIndicator, StdoutBridge, StudyOpener,
};
use crate::config::{Settings, SettingsStore};
use crate::engine::{ListingOutcome, classify_listing, select_best_study};
use crate::error::MonitorError;
use crate::identity::{self, CurrentIdentity, IdentitySource, Reconciliation};
use crate::observer::{self, ObservedIdentity, ResponseTap};
use crate::reporter::{Reporter, Status};
use crate::signout::{self, NavigationKind};
use crate::state::{SessionSnapshot, SessionState, SharedSession, lock};
use crate::types::{Alert, AlertKind, ControlMessage, Header, LogKind, PollState, Study};
use crate::AUTH_URL_PREFIX;

/// Everything the loop talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub marketplace: Arc<dyn Marketplace>,
    pub settings: Arc<dyn SettingsStore>,
    pub indicator: Arc<dyn StatusIndicator>,
    pub reauth: Arc<dyn Reauthenticator>,
    pub opener: Arc<dyn StudyOpener>,
    pub alerts: Arc<dyn AlertSink>,
}

impl Collaborators {
    /// Browser-side collaborators realised as JSON lines on stdout.
    pub fn stdout(marketplace: Arc<dyn Marketplace>, settings: Arc<dyn SettingsStore>) -> Self {
        let bridge = Arc::new(StdoutBridge);
        Self {
            marketplace,
            settings,
            indicator: bridge.clone(),
            reauth: bridge.clone(),
            opener: bridge.clone(),
            alerts: bridge,
        }
    }
}

/// Reasons to run a cycle now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Timer,
    Message(ControlMessage),
    CredentialAcquired,
}

/// A study to auto-start once the session lock is released.
struct Claim {
    uid: String,
    study_id: String,
}

/// The credential a cycle started with is gone.
#[derive(Debug)]
struct Superseded;

/// Cycle executor. Only `run` drives it, so cycles never overlap.
pub struct Monitor {
    session: SharedSession,
    deps: Collaborators,
    reporter: Reporter,
    request_timeout: Duration,
    triggers: UnboundedReceiver<Trigger>,
}

impl Monitor {
    pub fn new(deps: Collaborators, request_timeout: Duration) -> (Self, MonitorHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = SharedSession::default();
        let reporter = Reporter::new(deps.indicator.clone());
        let handle = MonitorHandle {
            tx,
            session: session.clone(),
            reporter: reporter.clone(),
            settings: deps.settings.clone(),
            opener: deps.opener.clone(),
        };
        let monitor = Self {
            session,
            deps,
            reporter,
            request_timeout,
            triggers: rx,
        };
        (monitor, handle)
    }

    /// Spawn the loop on the current runtime.
    pub fn start(deps: Collaborators, request_timeout: Duration) -> (MonitorHandle, JoinHandle<()>) {
        let (monitor, handle) = Self::new(deps, request_timeout);
        let task = tokio::spawn(monitor.run());
        (handle, task)
    }

    pub fn session(&self) -> SharedSession {
        self.session.clone()
    }

    /// Run cycles until every handle is dropped.
    ///
    /// The first cycle starts immediately. Afterwards a single timer is armed
    /// per cycle; any trigger cancels it. Triggers that queue up while a cycle
    /// is in flight are coalesced into one follow-up cycle.
    pub async fn run(mut self) {
        let mut batch = vec![Trigger::Timer];
        loop {
            debug!(?batch, "Starting poll cycle");
            let validate = batch.contains(&Trigger::Message(ControlMessage::CheckAndValidateId));
            self.run_cycle().await;
            if validate {
                self.raise_identity_alert();
            }

            let interval = self.deps.settings.load().check_interval();
            debug!("Next cycle in {}s", interval.as_secs());
            let sleep = tokio::time::sleep(interval);
            tokio::pin!(sleep);

            batch.clear();
            tokio::select! {
                _ = &mut sleep => batch.push(Trigger::Timer),
                trigger = self.triggers.recv() => match trigger {
                    Some(t) => batch.push(t),
                    None => {
                        info!("All monitor handles dropped, stopping");
                        return;
                    }
                },
            }
            while let Ok(t) = self.triggers.try_recv() {
                batch.push(t);
            }
        }
    }

    /// One pass of the state machine. Never fails; errors end up in the
    /// session log, the badge and `last_error`.
    pub async fn run_cycle(&self) -> PollState {
        let settings = self.deps.settings.load();
        let credential = {
            let mut st = lock(&self.session);
            st.poll_state = PollState::Polling;
            self.reporter.status(&mut st, Status::Polling);
            st.credential.clone()
        };

        let Some(credential) = credential else {
            self.no_credential();
            return PollState::NoCredential;
        };

        let listing = self
            .bounded(self.deps.marketplace.fetch_studies(&credential))
            .await;
        let outcome = classify_listing(listing);
        let state = outcome.state;
        let reauth = outcome.error.as_ref().is_some_and(MonitorError::is_auth);
        let Ok(claim) = self.apply_listing(&credential, outcome, &settings) else {
            return self.abandon("listing");
        };

        if reauth {
            self.deps.reauth.reauthenticate();
        }
        if let Some(claim) = claim {
            if !self.holds(&credential) {
                return self.abandon("claim");
            }
            self.claim(&credential, claim).await;
            if !self.holds(&credential) {
                return self.abandon("claim");
            }
        }

        if self.maintain_identity(&credential, &settings).await.is_err() {
            return self.abandon("identity maintenance");
        }
        state
    }

    /// Whether the session still carries the credential a cycle started with.
    fn holds(&self, credential: &Credential) -> bool {
        lock(&self.session).credential.as_ref() == Some(credential)
    }

    /// Leave a cycle whose credential was cleared or replaced mid-flight. The
    /// session already reflects whatever replaced it.
    fn abandon(&self, step: &str) -> PollState {
        info!("Credential changed during {step}, dropping the rest of the cycle");
        lock(&self.session).poll_state
    }

    fn no_credential(&self) {
        {
            let mut st = lock(&self.session);
            st.poll_state = PollState::NoCredential;
            st.last_error = Some(MonitorError::NoCredential.code());
            self.reporter.status(&mut st, Status::Error);
            self.reporter
                .log(&mut st, "ERROR - Auth Header missing", LogKind::Error, "Auth header is missing");
        }
        self.deps.reauth.reauthenticate();
    }

    fn apply_listing(
        &self,
        credential: &Credential,
        outcome: ListingOutcome,
        settings: &Settings,
    ) -> Result<Option<Claim>, Superseded> {
        let mut st = lock(&self.session);
        if st.credential.as_ref() != Some(credential) {
            return Err(Superseded);
        }
        st.poll_state = outcome.state;

        match (outcome.state, &outcome.error) {
            (PollState::AuthError, Some(err)) => {
                st.last_error = Some(err.code());
                self.reporter.status(&mut st, Status::AuthError);
                self.reporter.log(
                    &mut st,
                    "AUTHENTICATION ERROR",
                    LogKind::Error,
                    &format!("ERROR 401 Occurred\n{err}"),
                );
            }
            (_, Some(err @ (MonitorError::Transport(_) | MonitorError::Timeout(_)))) => {
                st.last_error = Some(err.code());
                self.reporter.status(&mut st, Status::Error);
                self.reporter.log(
                    &mut st,
                    "ERROR - fetchStudies",
                    LogKind::Error,
                    &format!("Exception occurred:\n{err}"),
                );
            }
            (_, Some(err)) => {
                st.last_error = Some(err.code());
                self.reporter.status(&mut st, Status::Error);
                self.reporter.log(
                    &mut st,
                    "OTHER ERROR",
                    LogKind::Error,
                    &format!("Unknown ERROR Occurred\n{err}"),
                );
            }
            (_, None) => {
                st.last_error = None;
                self.reporter.status(&mut st, Status::Healthy);
                self.reporter
                    .log(&mut st, "OK!", LogKind::Status, "Everything seems to be fine");
            }
        }

        if outcome.clear_results {
            st.studies.clear();
        }
        let Some(results) = outcome.results else {
            return Ok(None);
        };
        Ok(self.update_studies(&mut st, results, settings))
    }

    /// Publish a fresh collection and pick a study to auto-start.
    fn update_studies(
        &self,
        st: &mut SessionState,
        results: Vec<Study>,
        settings: &Settings,
    ) -> Option<Claim> {
        let count = results.len();
        st.studies = results;
        st.last_checked = Some(Utc::now());

        if count == 0 {
            self.reporter.status(st, Status::ZeroResults);
            self.reporter
                .log(st, "0 STUDIES FOUND", LogKind::ZeroStudies, "no studies found.");
            return None;
        }

        self.reporter.status(st, Status::Count(count));
        self.reporter.log(
            st,
            &format!("{count} STUDIES FOUND"),
            LogKind::Studies,
            &format!("{count} studies found."),
        );

        let best_id = select_best_study(&st.studies)?.id.clone();
        if !settings.autostart || best_id.is_empty() {
            return None;
        }
        match st.uid() {
            Some(uid) => Some(Claim {
                uid: uid.to_string(),
                study_id: best_id,
            }),
            None => {
                self.reporter.log(
                    st,
                    "AUTOSTART SKIPPED",
                    LogKind::Error,
                    &format!("No Prolific ID known yet, cannot start study {best_id}"),
                );
                None
            }
        }
    }

    async fn claim(&self, credential: &Credential, claim: Claim) {
        info!("Auto-starting study {}", claim.study_id);
        let result = self
            .bounded(
                self.deps
                    .marketplace
                    .start_study(credential, &claim.uid, &claim.study_id),
            )
            .await;

        let mut st = lock(&self.session);
        match result {
            Ok(()) => self.reporter.log(
                &mut st,
                "STUDY STARTED",
                LogKind::Success,
                &format!("Started study {}", claim.study_id),
            ),
            Err(e) => self.reporter.log(
                &mut st,
                "ERROR - startStudy",
                LogKind::Error,
                &format!("Could not start study {}\n{e}", claim.study_id),
            ),
        }
    }

    /// Keep the identity, account info and submissions current.
    async fn maintain_identity(
        &self,
        credential: &Credential,
        settings: &Settings,
    ) -> Result<(), Superseded> {
        let current = lock(&self.session).identity.clone();
        match current {
            Some(current) => {
                let account = self
                    .bounded(self.deps.marketplace.fetch_account(credential, &current.uid))
                    .await;
                let agrees = match account {
                    Ok(account) => {
                        let agrees = account.id.as_deref() == Some(current.uid.as_str());
                        let mut st = lock(&self.session);
                        if st.credential.as_ref() != Some(credential) {
                            return Err(Superseded);
                        }
                        st.account_info = Some(account);
                        agrees
                    }
                    Err(e) => {
                        debug!("Account lookup for {} failed: {e}", current.uid);
                        false
                    }
                };
                if !agrees {
                    self.reconcile(credential, Some(&current), &settings.uid).await?;
                }
            }
            None => self.reconcile(credential, None, &settings.uid).await?,
        }

        let uid = {
            let st = lock(&self.session);
            if st.credential.as_ref() != Some(credential) {
                return Err(Superseded);
            }
            st.uid().map(str::to_string)
        };
        let Some(uid) = uid else {
            return Ok(());
        };
        let submissions = self
            .bounded(self.deps.marketplace.fetch_submissions(credential, &uid))
            .await;
        let mut st = lock(&self.session);
        if st.credential.as_ref() != Some(credential) {
            return Err(Superseded);
        }
        match submissions {
            Ok(resp) => {
                if let Some(results) = resp.results {
                    st.submissions = results;
                }
            }
            Err(e) => debug!("Submissions lookup for {uid} failed: {e}"),
        }
        Ok(())
    }

    async fn reconcile(
        &self,
        credential: &Credential,
        current: Option<&CurrentIdentity>,
        configured: &str,
    ) -> Result<(), Superseded> {
        let outcome = match tokio::time::timeout(
            self.request_timeout,
            identity::reconcile(self.deps.marketplace.as_ref(), credential, current, configured),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Reconciliation::Invalid {
                uid: configured.to_string(),
                reason: MonitorError::Timeout(self.request_timeout).to_string(),
            },
        };

        let mut st = lock(&self.session);
        if st.credential.as_ref() != Some(credential) {
            return Err(Superseded);
        }
        match outcome {
            Reconciliation::KeepObserved => {
                debug!("Keeping identity observed from traffic");
            }
            Reconciliation::Adopt(identity) => {
                // Traffic may have supplied an identity while validation was in flight.
                if st
                    .identity
                    .as_ref()
                    .is_some_and(|i| i.source == IdentitySource::Observed)
                {
                    return Ok(());
                }
                self.reporter.log(
                    &mut st,
                    "Successfully Gathered Prolific ID from settings",
                    LogKind::Success,
                    &format!("Successfully Gathered Prolific ID from settings\nID: {}", identity.uid),
                );
                st.identity = Some(identity);
            }
            Reconciliation::Invalid { uid, reason } => {
                let err = MonitorError::IdentityInvalid(uid.clone());
                self.reporter.log(
                    &mut st,
                    "Prolific ID from settings is invalid",
                    LogKind::Error,
                    &format!("{err} ({reason})\nID: {uid}\nCode: {}", err.code()),
                );
            }
        }
        Ok(())
    }

    fn raise_identity_alert(&self) {
        let configured = self.deps.settings.load().uid;
        let alert = {
            let mut st = lock(&self.session);
            let alert = match st.uid() {
                Some(uid) if !configured.is_empty() && uid == configured => Alert {
                    kind: AlertKind::Ok,
                    text: format!("Prolific ID Changed to:\n{uid}"),
                },
                _ => Alert {
                    kind: AlertKind::Error,
                    text: format!("Prolific ID is Invalid:\n{configured}"),
                },
            };
            st.alerts.push(alert.clone());
            alert
        };
        self.deps.alerts.raise(&alert);
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, MonitorError>>,
    ) -> Result<T, MonitorError> {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(MonitorError::Timeout(self.request_timeout)),
        }
    }
}

/// Cloneable entry point for browser events and UI messages.
#[derive(Clone)]
pub struct MonitorHandle {
    tx: UnboundedSender<Trigger>,
    session: SharedSession,
    reporter: Reporter,
    settings: Arc<dyn SettingsStore>,
    opener: Arc<dyn StudyOpener>,
}

impl MonitorHandle {
    fn trigger(&self, trigger: Trigger) {
        if self.tx.send(trigger).is_err() {
            warn!("Monitor loop has stopped; dropping {trigger:?}");
        }
    }

    /// Inbound control message from the UI.
    pub fn send_message(&self, message: ControlMessage) {
        self.trigger(Trigger::Message(message));
    }

    /// Outgoing request headers. Returns `true` on an acquisition edge, which
    /// also starts a cycle right away.
    pub fn observe_request(&self, url: &str, headers: &[Header]) -> bool {
        let Some(credential) = observer::credential_from_request(url, headers) else {
            return false;
        };
        let acquired = lock(&self.session).set_credential(credential);
        if acquired {
            info!("Credential acquired from {url}");
            self.trigger(Trigger::CredentialAcquired);
        }
        acquired
    }

    /// Response headers of the OAuth authorize endpoint.
    pub fn observe_auth_redirect(&self, url: &str, location: &str) -> bool {
        if !url.starts_with(AUTH_URL_PREFIX) {
            return false;
        }
        let Some(tokens) = auth::tokens_from_redirect(location) else {
            debug!("Authorize redirect without access token");
            return false;
        };
        {
            let mut st = lock(&self.session);
            st.set_credential(tokens.credential);
            st.id_token = tokens.id_token;
        }
        info!("Credential acquired from authorize redirect");
        self.trigger(Trigger::CredentialAcquired);
        true
    }

    /// Start tapping a response body, if it belongs to the identity endpoint.
    pub fn tap_identity_response(&self, url: &str) -> Option<IdentityTap> {
        if !observer::is_identity_endpoint(url) {
            return None;
        }
        Some(IdentityTap {
            tap: ResponseTap::new(url),
            handle: self.clone(),
        })
    }

    /// Make an identity seen in traffic the current one and persist it.
    pub fn apply_observed_identity(&self, seen: ObservedIdentity) {
        let configured = self.settings.load().uid;
        {
            let mut st = lock(&self.session);
            if let Some(account) = seen.account {
                st.account_info = Some(account);
            }
            st.identity = Some(CurrentIdentity::observed(&seen.uid));
            if configured != seen.uid {
                self.reporter.log(
                    &mut st,
                    "Automatically Gathered UserID from HTTP request",
                    LogKind::Success,
                    &format!("Automatically Gathered UserID from HTTP request: {}", seen.uid),
                );
            }
        }
        if configured != seen.uid {
            self.settings.set_uid(&seen.uid);
        }
    }

    /// Navigation event. Returns `true` if it signed the user out.
    pub fn on_navigation(&self, url: &str, kind: NavigationKind) -> bool {
        if !signout::is_sign_out(url, kind) {
            return false;
        }
        let mut st = lock(&self.session);
        st.clear_credential();
        st.studies.clear();
        st.last_checked = Some(Utc::now());
        st.last_error = Some(MonitorError::NoCredential.code());
        st.poll_state = PollState::NoCredential;
        self.reporter.status(&mut st, Status::Error);
        self.reporter.log(
            &mut st,
            "SIGNED OUT",
            LogKind::Error,
            &format!("Sign-out detected at {url}, credential cleared"),
        );
        true
    }

    /// Route one browser event to its handler.
    pub fn dispatch(&self, event: BrowserEvent) {
        match event {
            BrowserEvent::RequestHeaders { url, headers } => {
                self.observe_request(&url, &headers);
            }
            BrowserEvent::ResponseBody { url, body } => {
                if let Some(mut tap) = self.tap_identity_response(&url) {
                    tap.pass(body.as_bytes());
                    tap.finish();
                }
            }
            BrowserEvent::AuthRedirect { url, location } => {
                self.observe_auth_redirect(&url, &location);
            }
            BrowserEvent::Navigation { url, kind } => {
                self.on_navigation(&url, kind);
            }
            BrowserEvent::Message { message } => match message.parse::<ControlMessage>() {
                Ok(message) => self.send_message(message),
                Err(e) => warn!("{e}"),
            },
            BrowserEvent::NotificationClicked { id } => self.on_notification_clicked(&id),
        }
    }

    pub fn on_notification_clicked(&self, id: &str) {
        self.opener.open_study(id);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        lock(&self.session).snapshot()
    }

    /// Drain alerts not yet shown by the UI.
    pub fn take_alerts(&self) -> Vec<Alert> {
        std::mem::take(&mut lock(&self.session).alerts)
    }
}

/// Pass-through tap that applies the identity once the body has been seen.
pub struct IdentityTap {
    tap: ResponseTap,
    handle: MonitorHandle,
}

impl IdentityTap {
    pub fn pass<'a>(&mut self, chunk: &'a [u8]) -> &'a [u8] {
        self.tap.pass(chunk)
    }

    /// Best effort; a body without an id is silently ignored.
    pub fn finish(self) -> Option<String> {
        let seen = self.tap.finish()?;
        let uid = seen.uid.clone();
        debug!("Identity {uid} observed in traffic");
        self.handle.apply_observed_identity(seen);
        Some(uid)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{FakeBrowser, FakeMarketplace, study};
    use super::*;
    use crate::config::MemorySettings;
    use crate::types::{ApiResponse, BadgeColor};
    use crate::{APP_LOGIN_URL, LOGIN_PAGE_URL};

    const TIMEOUT: Duration = Duration::from_secs(2);

    struct Rig {
        monitor: Monitor,
        handle: MonitorHandle,
        market: Arc<FakeMarketplace>,
        browser: Arc<FakeBrowser>,
        settings: Arc<MemorySettings>,
    }

    fn rig_with_timeout(market: FakeMarketplace, settings: Settings, timeout: Duration) -> Rig {
        let market = Arc::new(market);
        let browser = Arc::new(FakeBrowser::default());
        let settings = Arc::new(MemorySettings::new(settings));
        let deps = Collaborators {
            marketplace: market.clone(),
            settings: settings.clone(),
            indicator: browser.clone(),
            reauth: browser.clone(),
            opener: browser.clone(),
            alerts: browser.clone(),
        };
        let (monitor, handle) = Monitor::new(deps, timeout);
        Rig {
            monitor,
            handle,
            market,
            browser,
            settings,
        }
    }

    fn rig(market: FakeMarketplace, settings: Settings) -> Rig {
        rig_with_timeout(market, settings, TIMEOUT)
    }

    fn settings(uid: &str, autostart: bool) -> Settings {
        Settings {
            uid: uid.to_string(),
            autostart,
            check_interval: 3600,
        }
    }

    fn login(handle: &MonitorHandle) -> bool {
        handle.observe_request(
            "https://www.prolific.co/api/v1/studies/",
            &[Header::new("Authorization", "Bearer tok")],
        )
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        tokio::time::timeout(TIMEOUT, async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    // ── no credential ──────────────────────────────────────────────

    #[tokio::test]
    async fn no_credential_skips_network_and_reauthenticates() {
        let r = rig(FakeMarketplace::default(), settings("u1", true));

        let state = r.monitor.run_cycle().await;

        assert_eq!(state, PollState::NoCredential);
        assert_eq!(r.market.calls("fetch_studies"), 0);
        assert_eq!(r.market.calls("check_user_id"), 0);
        assert_eq!(r.browser.reauths(), 1);

        let snap = r.handle.snapshot();
        assert_eq!(snap.poll_state, PollState::NoCredential);
        assert_eq!(snap.last_error, Some(401));
        assert_eq!(snap.badge.text, "ERR");
        assert_eq!(r.browser.badge_texts(), vec!["...", "ERR"]);
        assert_eq!(r.browser.badge_colors(), vec![BadgeColor::Orange, BadgeColor::Black]);
        assert!(snap.logs.iter().any(|e| e.data == "ERROR - Auth Header missing"));
    }

    // ── listing outcomes ───────────────────────────────────────────

    #[tokio::test]
    async fn auth_error_clears_results_and_reauthenticates_once() {
        let market = FakeMarketplace::default().with_listing(Ok(ApiResponse::err(401)));
        let r = rig(market, settings("", false));
        login(&r.handle);
        lock(&r.monitor.session()).studies = vec![study("stale", 1.0)];

        let state = r.monitor.run_cycle().await;

        assert_eq!(state, PollState::AuthError);
        assert_eq!(r.browser.reauths(), 1);
        let snap = r.handle.snapshot();
        assert!(snap.studies.is_empty());
        assert_eq!(snap.last_error, Some(401));
        assert_eq!(snap.badge.text, "!");
        assert_eq!(snap.badge.color, BadgeColor::Red);
    }

    #[tokio::test]
    async fn autostart_claims_highest_reward() {
        let market = FakeMarketplace::default()
            .with_account("u1")
            .with_listing(Ok(ApiResponse::ok(vec![study("a", 5.0), study("b", 9.0)])));
        let r = rig(market, settings("u1", true));
        login(&r.handle);
        lock(&r.monitor.session()).identity = Some(CurrentIdentity::configured("u1"));

        let state = r.monitor.run_cycle().await;

        assert_eq!(state, PollState::Ok);
        assert_eq!(r.market.args("start_study"), vec!["b".to_string()]);
        let snap = r.handle.snapshot();
        assert_eq!(snap.studies.len(), 2);
        assert_eq!(snap.badge.text, "2");
        assert!(snap.last_checked.is_some());
        assert!(snap.logs.iter().any(|e| e.data == "STUDY STARTED"));
    }

    #[tokio::test]
    async fn autostart_disabled_does_not_claim() {
        let market = FakeMarketplace::default()
            .with_account("u1")
            .with_listing(Ok(ApiResponse::ok(vec![study("a", 5.0)])));
        let r = rig(market, settings("u1", false));
        login(&r.handle);

        r.monitor.run_cycle().await;

        assert_eq!(r.market.calls("start_study"), 0);
    }

    #[tokio::test]
    async fn empty_listing_reports_ok_and_zero_studies() {
        let r = rig(FakeMarketplace::default(), settings("", false));
        login(&r.handle);

        let state = r.monitor.run_cycle().await;

        assert_eq!(state, PollState::Ok);
        let snap = r.handle.snapshot();
        assert_eq!(snap.badge.text, "OK");
        assert_eq!(snap.badge.color, BadgeColor::Lime);
        assert_eq!(snap.last_error, None);
        assert!(snap.logs.iter().any(|e| e.kind == LogKind::ZeroStudies));
    }

    #[tokio::test]
    async fn transport_error_clears_results() {
        let market = FakeMarketplace::default()
            .with_listing(Err(MonitorError::Transport("connection refused".into())));
        let r = rig(market, settings("", false));
        login(&r.handle);
        lock(&r.monitor.session()).studies = vec![study("stale", 1.0)];

        let state = r.monitor.run_cycle().await;

        assert_eq!(state, PollState::MarketplaceError);
        assert_eq!(r.browser.reauths(), 0);
        let snap = r.handle.snapshot();
        assert!(snap.studies.is_empty());
        assert_eq!(snap.badge.text, "ERR");
        assert_eq!(snap.badge.color, BadgeColor::Black);
        assert!(snap.logs.iter().any(|e| e.description.contains("connection refused")));
    }

    #[tokio::test]
    async fn hung_listing_times_out() {
        let market = FakeMarketplace::default().with_listing_delay(Duration::from_millis(500));
        let r = rig_with_timeout(market, settings("", false), Duration::from_millis(50));
        login(&r.handle);

        let state = r.monitor.run_cycle().await;

        assert_eq!(state, PollState::MarketplaceError);
        let snap = r.handle.snapshot();
        assert_eq!(snap.last_error, Some(0));
        assert!(snap.logs.iter().any(|e| e.description.contains("timed out")));
    }

    #[tokio::test]
    async fn other_error_still_publishes_results() {
        let mut resp = ApiResponse::err(429);
        resp.results = Some(vec![study("a", 3.0)]);
        let r = rig(FakeMarketplace::default().with_listing(Ok(resp)), settings("", false));
        login(&r.handle);

        let state = r.monitor.run_cycle().await;

        assert_eq!(state, PollState::MarketplaceError);
        let snap = r.handle.snapshot();
        assert_eq!(snap.studies.len(), 1);
        assert_eq!(snap.last_error, Some(429));
    }

    // ── identity ───────────────────────────────────────────────────

    #[tokio::test]
    async fn configured_identity_adopted_once_then_reused() {
        let r = rig(FakeMarketplace::default().with_account("u1"), settings("u1", false));
        login(&r.handle);

        r.monitor.run_cycle().await;
        let snap = r.handle.snapshot();
        assert_eq!(snap.identity, Some(CurrentIdentity::configured("u1")));
        assert_eq!(r.market.calls("check_user_id"), 1);

        r.monitor.run_cycle().await;
        assert_eq!(r.market.calls("check_user_id"), 1);
        assert_eq!(r.market.args("fetch_account").last().map(String::as_str), Some("u1"));
        assert_eq!(r.market.args("fetch_submissions"), vec!["u1", "u1"]);
        assert_eq!(r.handle.snapshot().submissions.len(), 1);
    }

    #[tokio::test]
    async fn invalid_configured_identity_leaves_identity_empty() {
        let r = rig(FakeMarketplace::default(), settings("nobody", false));
        login(&r.handle);

        r.monitor.run_cycle().await;

        let snap = r.handle.snapshot();
        assert!(snap.identity.is_none());
        assert!(snap.logs.iter().any(|e| e.data == "Prolific ID from settings is invalid"));
        assert_eq!(r.market.calls("fetch_submissions"), 0);
    }

    #[tokio::test]
    async fn observed_identity_from_traffic_wins() {
        let r = rig(FakeMarketplace::default().with_account("other"), settings("configured", false));
        login(&r.handle);

        let mut tap = r
            .handle
            .tap_identity_response("https://www.prolific.co/api/v1/users/seen/")
            .expect("identity endpoint");
        let body = br#"{"id":"seen","name":"P"}"#;
        assert_eq!(tap.pass(body), body);
        assert_eq!(tap.finish().as_deref(), Some("seen"));

        assert_eq!(r.settings.load().uid, "seen");
        let snap = r.handle.snapshot();
        assert_eq!(snap.identity, Some(CurrentIdentity::observed("seen")));
        assert!(snap.account_info.is_some());
        assert!(snap.logs.iter().any(|e| e.data.starts_with("Automatically Gathered")));

        // Account lookup disagrees, but an observed identity is never replaced.
        r.monitor.run_cycle().await;
        assert_eq!(r.market.calls("check_user_id"), 0);
        assert_eq!(
            r.handle.snapshot().identity,
            Some(CurrentIdentity::observed("seen"))
        );
    }

    #[tokio::test]
    async fn non_identity_urls_are_not_tapped() {
        let r = rig(FakeMarketplace::default(), settings("", false));
        assert!(r.handle.tap_identity_response("https://www.prolific.co/api/v1/studies/").is_none());
    }

    #[tokio::test]
    async fn validation_alert() {
        let r = rig(FakeMarketplace::default().with_account("u1"), settings("u1", false));
        login(&r.handle);
        r.monitor.run_cycle().await;
        r.monitor.raise_identity_alert();

        r.settings.update(|s| s.uid = "typo".to_string());
        r.monitor.raise_identity_alert();

        let alerts = r.browser.alerts();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].kind, AlertKind::Ok);
        assert!(alerts[0].text.contains("u1"));
        assert_eq!(alerts[1].kind, AlertKind::Error);
        assert!(alerts[1].text.contains("typo"));
        assert_eq!(r.handle.take_alerts().len(), 2);
        assert!(r.handle.take_alerts().is_empty());
    }

    // ── traffic and navigation ─────────────────────────────────────

    #[tokio::test]
    async fn acquisition_edge_only_once() {
        let r = rig(FakeMarketplace::default(), settings("", false));
        assert!(login(&r.handle));
        assert!(!login(&r.handle));
        assert!(!r.handle.observe_request(
            "https://www.prolific.co/api/v1/studies/",
            &[Header::new("Authorization", "Bearer null")],
        ));
    }

    #[tokio::test]
    async fn auth_redirect_supplies_credential() {
        let r = rig(FakeMarketplace::default(), settings("", false));
        assert!(!r.handle.observe_auth_redirect(
            "https://www.prolific.co/other",
            "https://app.prolific.co/oauth/callback#access_token=t1",
        ));
        assert!(r.handle.observe_auth_redirect(
            "https://www.prolific.co/openid/authorize?client_id=1",
            "https://app.prolific.co/oauth/callback#access_token=t1&id_token=i1",
        ));

        r.monitor.run_cycle().await;
        assert_eq!(r.market.args("fetch_studies"), vec!["Bearer t1"]);
        assert_eq!(lock(&r.monitor.session()).id_token.as_deref(), Some("i1"));
    }

    #[tokio::test]
    async fn sign_out_returns_to_cold_start() {
        let market =
            FakeMarketplace::default().with_listing(Ok(ApiResponse::ok(vec![study("a", 1.0)])));
        let r = rig(market, settings("", false));
        login(&r.handle);
        r.monitor.run_cycle().await;
        assert_eq!(r.handle.snapshot().studies.len(), 1);

        assert!(!r.handle.on_navigation(LOGIN_PAGE_URL, NavigationKind::HistoryStateUpdated));
        assert!(r.handle.on_navigation(APP_LOGIN_URL, NavigationKind::HistoryStateUpdated));

        let snap = r.handle.snapshot();
        assert!(!snap.authenticated);
        assert!(snap.studies.is_empty());
        assert_eq!(snap.last_error, Some(401));
        assert_eq!(r.browser.reauths(), 0);

        let state = r.monitor.run_cycle().await;
        assert_eq!(state, PollState::NoCredential);
        assert_eq!(r.market.calls("fetch_studies"), 1);
        assert_eq!(r.browser.reauths(), 1);

        // Logging in again is a fresh acquisition edge.
        assert!(login(&r.handle));
    }

    #[tokio::test]
    async fn sign_out_during_listing_abandons_cycle() {
        let market = FakeMarketplace::default()
            .with_account("u1")
            .with_listing(Ok(ApiResponse::ok(vec![study("a", 5.0), study("b", 9.0)])))
            .with_listing_delay(Duration::from_millis(200));
        let r = rig(market, settings("u1", true));
        login(&r.handle);
        lock(&r.monitor.session()).identity = Some(CurrentIdentity::configured("u1"));

        let handle = r.handle.clone();
        let sign_out = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.on_navigation(APP_LOGIN_URL, NavigationKind::HistoryStateUpdated)
        });
        let state = r.monitor.run_cycle().await;
        assert!(sign_out.await.expect("sign-out task"));

        assert_eq!(state, PollState::NoCredential);
        assert_eq!(r.market.calls("start_study"), 0);
        assert_eq!(r.market.calls("fetch_account"), 0);
        assert_eq!(r.market.calls("fetch_submissions"), 0);
        let snap = r.handle.snapshot();
        assert!(!snap.authenticated);
        assert!(snap.studies.is_empty());
        assert_eq!(snap.poll_state, PollState::NoCredential);
        assert_eq!(snap.last_error, Some(401));
        assert_eq!(snap.badge.text, "ERR");
        assert_eq!(snap.badge.color, BadgeColor::Black);
        assert!(!snap.logs.iter().any(|e| e.kind == LogKind::Studies));
    }

    #[tokio::test]
    async fn notification_click_opens_study() {
        let r = rig(FakeMarketplace::default(), settings("", false));
        r.handle.on_notification_clicked("study-9");
        assert_eq!(r.browser.opened(), vec!["study-9"]);
    }

    #[tokio::test]
    async fn dispatch_routes_events() {
        let r = rig(FakeMarketplace::default(), settings("", false));
        r.handle.dispatch(BrowserEvent::RequestHeaders {
            url: "https://www.prolific.co/api/v1/studies/".into(),
            headers: vec![Header::new("Authorization", "Bearer d1")],
        });
        r.handle.dispatch(BrowserEvent::ResponseBody {
            url: "https://www.prolific.co/api/v1/users/abc/".into(),
            body: "encrypted".into(),
        });
        r.handle.dispatch(BrowserEvent::NotificationClicked { id: "s1".into() });
        r.handle.dispatch(BrowserEvent::Message {
            message: "unknown".into(),
        });

        let snap = r.handle.snapshot();
        assert!(snap.authenticated);
        assert_eq!(snap.identity, Some(CurrentIdentity::observed("abc")));
        assert_eq!(r.browser.opened(), vec!["s1"]);

        r.handle.dispatch(BrowserEvent::Navigation {
            url: LOGIN_PAGE_URL.into(),
            kind: NavigationKind::Completed,
        });
        assert!(!r.handle.snapshot().authenticated);
    }

    // ── loop scheduling ────────────────────────────────────────────

    #[tokio::test]
    async fn acquisition_edge_runs_cycle_immediately() {
        let r = rig(FakeMarketplace::default(), settings("", false));
        let browser = r.browser.clone();
        let market = r.market.clone();
        let handle = r.handle.clone();
        let task = tokio::spawn(r.monitor.run());

        // Startup cycle finds no credential.
        wait_for(|| browser.reauths() == 1).await;
        assert_eq!(market.calls("fetch_studies"), 0);

        assert!(login(&handle));
        wait_for(|| market.calls("fetch_studies") == 1).await;

        task.abort();
    }

    #[tokio::test]
    async fn queued_triggers_coalesce_into_one_cycle() {
        let r = rig(FakeMarketplace::default(), settings("", false));
        login(&r.handle);
        r.handle.send_message(ControlMessage::CheckForStudies);
        r.handle.send_message(ControlMessage::CheckForStudies);
        r.handle.send_message(ControlMessage::CheckAndValidateId);

        let market = r.market.clone();
        let browser = r.browser.clone();
        let task = tokio::spawn(r.monitor.run());

        // Startup cycle plus one for the four queued triggers.
        wait_for(|| market.calls("fetch_studies") == 2).await;
        wait_for(|| browser.alerts().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(market.calls("fetch_studies"), 2);

        task.abort();
    }

    #[tokio::test]
    async fn triggers_during_a_cycle_run_one_follow_up() {
        let market = FakeMarketplace::default().with_listing_delay(Duration::from_millis(200));
        let r = rig(market, settings("", false));
        lock(&r.monitor.session()).set_credential(Credential::bearer("tok"));

        let market = r.market.clone();
        let handle = r.handle.clone();
        let task = tokio::spawn(r.monitor.run());

        // Startup cycle is now waiting on the listing.
        wait_for(|| market.calls("fetch_studies") == 1).await;
        handle.send_message(ControlMessage::CheckForStudies);
        handle.send_message(ControlMessage::CheckForStudies);
        handle.send_message(ControlMessage::CheckAndValidateId);

        wait_for(|| market.calls("fetch_studies") == 2).await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(market.calls("fetch_studies"), 2);

        task.abort();
    }

    #[tokio::test]
    async fn changed_interval_applies_at_next_schedule() {
        let r = rig(FakeMarketplace::default(), settings("", false));
        lock(&r.monitor.session()).set_credential(Credential::bearer("tok"));

        let market = r.market.clone();
        let handle = r.handle.clone();
        let store = r.settings.clone();
        let task = tokio::spawn(r.monitor.run());

        wait_for(|| market.calls("fetch_studies") == 1).await;
        store.update(|s| s.check_interval = 1);

        // The hour-long timer armed after the first cycle stays armed.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(market.calls("fetch_studies"), 1);

        // The next schedule reads the new interval.
        handle.send_message(ControlMessage::CheckForStudies);
        wait_for(|| market.calls("fetch_studies") == 2).await;
        wait_for(|| market.calls("fetch_studies") == 3).await;

        task.abort();
    }

    #[tokio::test]
    async fn loop_stops_when_handles_dropped() {
        let r = rig(FakeMarketplace::default(), settings("", false));
        let task = tokio::spawn(r.monitor.run());
        drop(r.handle);
        tokio::time::timeout(TIMEOUT, task)
            .await
            .expect("loop should stop")
            .expect("loop should not panic");
    }
}
