//! Admission controller - the main public API for Queuegate.
//!
//! [`AdmissionController::admit`] decides, for one page request, whether the
//! visitor may see the page or must be redirected to a queue:
//! 1. Read the visitor's uid from the store cookie
//! 2. Load settings through the shared [`SettingsCache`]
//! 3. Validate a passed query string, if the URL carries one
//! 4. Walk the queues in order, skipping those already passed
//! 5. For the first matching unpassed queue, consult the adapter server
//!    (safe mode) or send the visitor to the queue server (simple mode)
//!
//! The first redirect ends the request. Vendor failures never reach the host:
//! they are logged and resolved by the configured policies.

use crate::cache::settings::SettingsCache;
use crate::cache::store::{FileStore, SharedStore};
use crate::client::http::{adapter_url, decode, encode, BlockingHttpClient, VendorClient};
use crate::clock::{Clock, SystemClock};
use crate::config::{AdapterConfig, AdapterFailurePolicy, AdapterMode, FailurePolicy};
use crate::crypto::token::{
    verify_cookie_token, verify_query_token, QUEUE_ID_MARKER, QUEUE_NAME_MARKER,
};
use crate::policy::rules::{match_list, pick_variant};
use crate::protocol::models::{parse_adapter_response, AdapterResponse, Queue, SettingsDocument};
use crate::service::{RequestContext, Service};
use crate::AdapterError;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Passage cookie name prefix; the queue name follows.
pub const PASS_COOKIE_PREFIX: &str = "QueueFair-Pass-";

/// Visitor store cookie name prefix; the account name follows.
pub const STORE_COOKIE_PREFIX: &str = "QueueFair-Store-";

/// Path for every cookie the controller writes.
pub const COOKIE_PATH: &str = "/";

/// Decision traces, emitted only for requests the debug setting selects.
macro_rules! trace_visit {
    ($visit:expr, $($arg:tt)+) => {
        if $visit.trace {
            tracing::debug!($($arg)+);
        }
    };
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Serve the page.
    Continue,
    /// The visitor was redirected; do not serve the page.
    Redirected {
        /// Where the visitor was sent.
        location: String,
    },
    /// No settings could be loaded, so nothing was checked.
    SettingsUnavailable,
}

impl Admission {
    /// Whether the host should serve the page.
    pub fn allows_page(&self, policy: FailurePolicy) -> bool {
        match self {
            Self::Continue => true,
            Self::Redirected { .. } => false,
            Self::SettingsUnavailable => policy == FailurePolicy::Open,
        }
    }
}

/// Per-request state machine position.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Flow {
    Continue,
    Redirect(String),
}

impl From<Flow> for Admission {
    fn from(flow: Flow) -> Self {
        match flow {
            Flow::Continue => Admission::Continue,
            Flow::Redirect(location) => Admission::Redirected { location },
        }
    }
}

/// State of one visitor's request.
struct Visit<'r> {
    request: &'r RequestContext,
    service: &'r mut dyn Service,
    uid: Option<String>,
    passed: HashSet<String>,
    trace: bool,
    no_cache_sent: bool,
}

impl<'r> Visit<'r> {
    fn new(request: &'r RequestContext, service: &'r mut dyn Service, trace: bool) -> Self {
        Self {
            request,
            service,
            uid: None,
            passed: HashSet::new(),
            trace,
            no_cache_sent: false,
        }
    }

    fn cookie(&self, name: &str) -> Option<String> {
        self.service.get_cookie(name)
    }

    fn prevent_caching(&mut self) {
        if !self.no_cache_sent {
            self.no_cache_sent = true;
            self.service.set_no_cache();
        }
    }

    fn set_cookie(&mut self, name: &str, value: &str, lifetime_seconds: i64, domain: Option<&str>) {
        self.prevent_caching();
        trace_visit!(self, cookie = name, lifetime_seconds, ?domain, "setting cookie");
        self.service
            .set_cookie(name, value, lifetime_seconds, COOKIE_PATH, domain);
    }

    fn redirect(&mut self, location: String) -> Flow {
        self.prevent_caching();
        trace_visit!(self, %location, "redirecting");
        self.service.redirect(&location);
        Flow::Redirect(location)
    }

    fn mark_passed(&mut self, queue_name: &str) {
        trace_visit!(self, queue = queue_name, "marking queue passed");
        self.passed.insert(queue_name.to_string());
    }

    fn is_marked(&self, queue_name: &str) -> bool {
        self.passed.contains(queue_name)
    }
}

/// Passage cookie name for a queue.
pub fn pass_cookie_name(queue_name: &str) -> String {
    format!("{}{}", PASS_COOKIE_PREFIX, queue_name)
}

/// Visitor store cookie name for an account.
pub fn store_cookie_name(account: &str) -> String {
    format!("{}{}", STORE_COOKIE_PREFIX, account)
}

/// Append `key=value` to a URL, value form-encoded.
fn append_param(url: &mut String, key: &str, value: &str) {
    url.push(if url.contains('?') { '&' } else { '?' });
    url.push_str(key);
    url.push('=');
    url.push_str(&encode(value));
}

/// Main admission controller.
///
/// Create one per account and share it across request threads; it owns the
/// process's settings cache.
pub struct AdmissionController {
    config: AdapterConfig,
    settings: SettingsCache,
    client: Arc<dyn VendorClient>,
    clock: Arc<dyn Clock>,
}

impl AdmissionController {
    /// Create a controller with the file store, HTTP client, and system clock.
    ///
    /// # Errors
    /// Returns an error if:
    /// - Configuration validation fails
    /// - HTTP client creation fails
    /// - The settings cache directory cannot be created
    pub fn new(config: AdapterConfig) -> Result<Self, AdapterError> {
        config.validate()?;
        let store = FileStore::new(config.settings_cache_location.as_deref(), &config.account)?;
        let client = BlockingHttpClient::new(&config)?;
        Self::with_parts(config, Arc::new(store), Arc::new(client), Arc::new(SystemClock))
    }

    /// Create a controller over caller-supplied store, transport, and clock.
    pub fn with_parts(
        config: AdapterConfig,
        store: Arc<dyn SharedStore>,
        client: Arc<dyn VendorClient>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AdapterError> {
        config.validate()?;
        let settings = SettingsCache::new(&config, store, client.clone(), clock.clone());
        Ok(Self {
            config,
            settings,
            client,
            clock,
        })
    }

    /// Override the settings lock poll interval.
    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            settings: self.settings.with_poll_interval(poll_interval),
            ..self
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// The settings cache.
    pub fn settings(&self) -> &SettingsCache {
        &self.settings
    }

    /// Run the admission check for one request.
    ///
    /// Cookie writes and any redirect have already been issued through
    /// `service` when this returns.
    pub fn admit(&self, request: &RequestContext, service: &mut dyn Service) -> Admission {
        let trace = self.config.debug.applies_to(&request.remote_addr);
        let mut visit = Visit::new(request, service, trace);
        trace_visit!(
            visit,
            account = %self.config.account,
            url = %request.requested_url,
            "admission check started"
        );

        visit.uid = self.uid_from_cookie(&visit);

        let Some(settings) = self.settings.get() else {
            tracing::error!(account = %self.config.account, "no settings, admission check skipped");
            return Admission::SettingsUnavailable;
        };

        let flow = self.run(&settings, &mut visit);
        let continue_page = flow == Flow::Continue;
        trace_visit!(visit, continue_page, "admission check finished");
        flow.into()
    }

    /// Run the admission check and apply the settings failure policy.
    pub fn go(&self, request: &RequestContext, service: &mut dyn Service) -> bool {
        self.admit(request, service)
            .allows_page(self.config.settings_failure_policy)
    }

    /// Validate a passage cookie directly, for pages that only check passage.
    pub fn validate_cookie(
        &self,
        queue_secret: &str,
        passed_lifetime_minutes: u64,
        cookie: &str,
        user_agent: &str,
    ) -> bool {
        verify_cookie_token(
            queue_secret,
            passed_lifetime_minutes,
            cookie,
            user_agent,
            self.clock.as_ref(),
        )
    }

    fn uid_from_cookie(&self, visit: &Visit<'_>) -> Option<String> {
        let cookie = visit.cookie(&store_cookie_name(&self.config.account))?;
        let pos = cookie.find(':').or_else(|| cookie.find('='))?;
        let uid = &cookie[pos + 1..];
        if uid.is_empty() {
            return None;
        }
        trace_visit!(visit, uid, "found visitor uid");
        Some(uid.to_string())
    }

    fn run(&self, settings: &SettingsDocument, visit: &mut Visit<'_>) -> Flow {
        if let flow @ Flow::Redirect(_) = self.check_query_string(settings, visit) {
            return flow;
        }

        if settings.queues.is_empty() {
            trace_visit!(visit, "no queues configured");
        }

        for queue in &settings.queues {
            if self.has_passed(queue, visit) {
                trace_visit!(visit, queue = queue.label(), "queue already passed");
                continue;
            }

            let request = visit.request;
            let matched = match_list(&queue.activation.rules, &request.requested_url, &|name: &str| {
                visit.cookie(name)
            });
            if !matched {
                trace_visit!(visit, queue = queue.label(), "rules did not match");
                continue;
            }

            trace_visit!(visit, queue = queue.label(), "found matching unpassed queue");
            if let flow @ Flow::Redirect(_) = self.consult(queue, visit) {
                return flow;
            }
        }

        trace_visit!(visit, "all queues checked");
        Flow::Continue
    }

    /// Validate a passed query string carrying `qfqid` and `qfq`.
    fn check_query_string(&self, settings: &SettingsDocument, visit: &mut Visit<'_>) -> Flow {
        let request = visit.request;
        let query = request.query.as_str();

        let Some(id_pos) = query.rfind(QUEUE_ID_MARKER) else {
            return Flow::Continue;
        };
        let Some(name_pos) = query.rfind(QUEUE_NAME_MARKER) else {
            return Flow::Continue;
        };

        let name_start = name_pos + QUEUE_NAME_MARKER.len();
        let queue_name = query[name_start..].split('&').next().unwrap_or("");
        let Some(queue) = settings.queue(queue_name) else {
            trace_visit!(visit, queue = queue_name, "passed string names an unknown queue");
            return Flow::Continue;
        };

        if verify_query_token(
            &queue.secret,
            query,
            &request.user_agent,
            self.config.query_time_limit_seconds,
            self.clock.as_ref(),
        ) {
            trace_visit!(visit, queue = queue.label(), "passed string validated");
            visit.set_cookie(
                &pass_cookie_name(&queue.name),
                &query[id_pos..],
                queue.passed_lifetime_seconds(),
                queue.cookie_domain.as_deref(),
            );
            visit.mark_passed(&queue.name);

            if self.config.strip_passed_string {
                if let Some(pos) = request.requested_url.find(QUEUE_ID_MARKER) {
                    let location = request.requested_url[..pos]
                        .trim_end_matches(|c| c == '?' || c == '&');
                    return visit.redirect(location.to_string());
                }
            }
            return Flow::Continue;
        }

        if let Some(cookie) = visit.cookie(&pass_cookie_name(&queue.name)) {
            if !cookie.is_empty() && self.cookie_is_valid(queue, &cookie, &request.user_agent) {
                trace_visit!(visit, queue = queue.label(), "passed string invalid but cookie valid");
                return Flow::Continue;
            }
        }

        tracing::warn!(queue = queue.label(), "invalid passed string, sending visitor to error page");
        visit.redirect(format!(
            "https://{}/{}?qfError=InvalidQuery",
            queue.queue_server, queue.name
        ))
    }

    /// Whether the visitor has passed `queue` this request or holds a valid
    /// passage cookie for it. An invalid cookie naming the queue is cleared.
    fn has_passed(&self, queue: &Queue, visit: &mut Visit<'_>) -> bool {
        if visit.is_marked(&queue.name) {
            return true;
        }

        let cookie_name = pass_cookie_name(&queue.name);
        let Some(cookie) = visit.cookie(&cookie_name) else {
            trace_visit!(visit, queue = queue.label(), "no passage cookie");
            return false;
        };

        if !cookie.contains(queue.name.as_str()) {
            trace_visit!(visit, queue = queue.label(), "passage cookie is for another queue");
            return false;
        }

        if !self.cookie_is_valid(queue, &cookie, &visit.request.user_agent) {
            trace_visit!(visit, queue = queue.label(), "passage cookie failed validation");
            visit.set_cookie(&cookie_name, "", 0, queue.cookie_domain.as_deref());
            return false;
        }

        visit.mark_passed(&queue.name);
        true
    }

    fn cookie_is_valid(&self, queue: &Queue, cookie: &str, user_agent: &str) -> bool {
        verify_cookie_token(
            &queue.secret,
            queue.passed_lifetime_minutes,
            cookie,
            user_agent,
            self.clock.as_ref(),
        )
    }

    /// Resolve a matched, unpassed queue.
    fn consult(&self, queue: &Queue, visit: &mut Visit<'_>) -> Flow {
        let mode = queue.adapter_mode.unwrap_or(self.config.adapter_mode);
        trace_visit!(visit, queue = queue.label(), ?mode, "consulting vendor");

        match mode {
            AdapterMode::Simple => self.send_to_queue_server(queue, visit),
            AdapterMode::Safe => match self.consult_adapter(queue, visit) {
                Ok(flow) => flow,
                Err(e) => {
                    tracing::warn!(
                        queue = queue.label(),
                        error = %e,
                        policy = ?self.config.adapter_failure_policy,
                        "adapter consult failed"
                    );
                    match self.config.adapter_failure_policy {
                        AdapterFailurePolicy::Proceed => Flow::Continue,
                        AdapterFailurePolicy::SendToQueue => self.send_to_queue_server(queue, visit),
                    }
                }
            },
        }
    }

    /// Simple mode: hand the visitor straight to the queue server.
    fn send_to_queue_server(&self, queue: &Queue, visit: &mut Visit<'_>) -> Flow {
        let mut location = format!("https://{}/{}", queue.queue_server, queue.name);
        append_param(&mut location, "target", &visit.request.requested_url);
        self.append_variant_and_extra(&mut location, queue, visit);
        visit.redirect(location)
    }

    /// Safe mode: ask the adapter server what to do with this visitor.
    fn consult_adapter(&self, queue: &Queue, visit: &mut Visit<'_>) -> Result<Flow, AdapterError> {
        let request = visit.request;
        let url = adapter_url(
            queue,
            &request.remote_addr,
            visit.uid.as_deref(),
            &request.user_agent,
        );
        trace_visit!(visit, %url, "calling adapter server");

        let body = self.client.get_text(&url)?;
        let response = parse_adapter_response(&body)?;
        trace_visit!(visit, action = ?response.action, queue = ?response.queue, "adapter responded");

        self.adopt_uid(&response, queue, visit);

        if response.action.is_none() {
            return Err(AdapterError::Protocol(
                "adapter response has no action".to_string(),
            ));
        }

        if response.sends_to_queue() {
            let location = response
                .location
                .as_deref()
                .filter(|l| !l.is_empty())
                .ok_or_else(|| AdapterError::Protocol("SendToQueue without location".to_string()))?;
            let location = self.queue_location(location, queue, visit);
            return Ok(visit.redirect(location));
        }

        let validation = response
            .validation
            .as_deref()
            .ok_or_else(|| AdapterError::Protocol("pass without validation".to_string()))?;
        let token = decode(validation)?;
        let passed_queue = response
            .queue
            .as_deref()
            .filter(|q| !q.is_empty())
            .unwrap_or(queue.name.as_str());

        visit.set_cookie(
            &pass_cookie_name(passed_queue),
            &token,
            queue.passed_lifetime_seconds(),
            queue.cookie_domain.as_deref(),
        );
        visit.mark_passed(passed_queue);
        Ok(Flow::Continue)
    }

    /// Record the vendor's uid for this visitor in the store cookie.
    fn adopt_uid(&self, response: &AdapterResponse, queue: &Queue, visit: &mut Visit<'_>) {
        let Some(vendor_uid) = response.uid.as_deref() else {
            return;
        };

        if let Some(known) = visit.uid.as_deref() {
            if known != vendor_uid {
                tracing::warn!(
                    expected = known,
                    received = vendor_uid,
                    "visitor uid mismatch, adopting the adapter's uid"
                );
            }
        }

        visit.uid = Some(vendor_uid.to_string());
        visit.set_cookie(
            &store_cookie_name(&self.config.account),
            &format!("u:{}", vendor_uid),
            i64::try_from(response.cookie_seconds).unwrap_or(i64::MAX),
            queue.cookie_domain.as_deref(),
        );
    }

    /// Queue page URL with target, uid, variant, and extra label attached.
    fn queue_location(&self, location: &str, queue: &Queue, visit: &Visit<'_>) -> String {
        let mut location = location.to_string();
        if queue.dynamic_target {
            append_param(&mut location, "target", &visit.request.requested_url);
        }
        if let Some(uid) = visit.uid.as_deref() {
            append_param(&mut location, "qfuid", uid);
        }
        self.append_variant_and_extra(&mut location, queue, visit);
        location
    }

    fn append_variant_and_extra(&self, location: &mut String, queue: &Queue, visit: &Visit<'_>) {
        let variant = pick_variant(
            &queue.activation.variant_rules,
            &visit.request.requested_url,
            &|name: &str| visit.cookie(name),
        );
        if let Some(variant) = variant {
            trace_visit!(visit, variant, "found variant");
            append_param(location, "qfv", variant);
        }
        if let Some(extra) = visit.request.extra.as_deref().filter(|e| !e.is_empty()) {
            append_param(location, "qfx", extra);
        }
    }
}
