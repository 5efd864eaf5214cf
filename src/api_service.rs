//! Request orchestration.
//!
//! [`ApiService`] executes one logical request end to end: it picks the
//! credential, builds the wire request against the current route, retries
//! routing failures, refreshes expired credentials, and hands challenges to
//! the [`ChallengeCoordinator`]. Callers only ever see one terminal success
//! or one fully classified failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use thiserror::Error;

use crate::auth::{
	AcquisitionOutcome, CredentialCoordinator, CredentialStore, FetchResult,
	HttpSessionAuthenticator, RefreshFailure, RefreshOutcome, SessionAuthenticator,
};
use crate::challenges::{
	ChallengeContext, ChallengeCoordinator, ChallengeResolution, Classification,
	ForceUpgradeDelegate, HumanVerificationDelegate, TransportFault, VerificationTicket, classify,
};
use crate::codes;
use crate::config::{ApiServiceConfig, ConfigError};
use crate::core::{
	ApiResponse, ClientIdentity, Credential, HeaderLayers, RequestSpec, ResponseError, body_code,
	body_error, compose_headers,
};
use crate::modules::events::{
	CompletedEvent, ErrorEvent, EventDispatcher, EventHandler, LoggingHandler, MetricsHandler,
	PostResponseEvent, PreRequestEvent, RetryReason, ServiceEvent,
};
use crate::modules::metrics::{MetricsCollector, MetricsSnapshot};
use crate::routing::{RoutingResolver, StaticRouting};
use crate::transport::{
	ReqwestTransport, Transport, TransportError, TransportRequest, TransportResponse,
	build_request,
};

/// Result alias used across the orchestration layer.
pub type ApiResult<T> = Result<T, ApiError>;

/// Terminal failure of one logical request.
#[derive(Debug, Error)]
pub enum ApiError {
	#[error("no credential store is registered")]
	LocalConfiguration,
	#[error("authenticated request without a session")]
	CredentialNotFound,
	#[error("transport error: {0}")]
	Transport(TransportError),
	#[error("request potentially blocked: {0}")]
	PotentiallyBlocked(TransportError),
	#[error("session invalidated: {0}")]
	SessionInvalidated(ResponseError),
	#[error("credential refresh failed: {0}")]
	RefreshFailed(ResponseError),
	#[error("too many refresh attempts")]
	TooManyRefreshAttempts,
	#[error("{0}")]
	Application(ResponseError),
	#[error("invalid request: {0}")]
	InvalidRequest(String),
	#[error("configuration error: {0}")]
	Configuration(#[from] ConfigError),
}

impl ApiError {
	/// Backend error behind this failure, when there is one.
	pub fn response_error(&self) -> Option<&ResponseError> {
		match self {
			ApiError::SessionInvalidated(error)
			| ApiError::RefreshFailed(error)
			| ApiError::Application(error) => Some(error),
			_ => None,
		}
	}

	/// Single integer identifying the failure: the backend code when known,
	/// a negative local code otherwise.
	pub fn code(&self) -> i64 {
		match self {
			ApiError::LocalConfiguration => codes::LOCAL_NO_CREDENTIAL_STORE,
			ApiError::CredentialNotFound => codes::LOCAL_CREDENTIAL_NOT_FOUND,
			ApiError::PotentiallyBlocked(_) => codes::LOCAL_POTENTIALLY_BLOCKED,
			ApiError::TooManyRefreshAttempts => codes::LOCAL_TOO_MANY_REFRESH_ATTEMPTS,
			ApiError::SessionInvalidated(error)
			| ApiError::RefreshFailed(error)
			| ApiError::Application(error) => error.best_code(),
			ApiError::Transport(_) | ApiError::InvalidRequest(_) | ApiError::Configuration(_) => 0,
		}
	}

	/// Whether the failure was produced without reaching the backend.
	pub fn is_local(&self) -> bool {
		matches!(
			self,
			ApiError::LocalConfiguration
				| ApiError::CredentialNotFound
				| ApiError::InvalidRequest(_)
				| ApiError::Configuration(_)
		)
	}
}

/// Host application hooks.
pub trait ServiceDelegate: Send + Sync {
	fn app_version(&self) -> String;

	fn user_agent(&self) -> Option<String> {
		None
	}

	fn locale(&self) -> String {
		"en_US".into()
	}

	fn additional_headers(&self) -> HashMap<String, String> {
		HashMap::new()
	}

	/// Server clock from the `Date` header of a response, in Unix seconds.
	fn on_update_server_time(&self, _unix_seconds: i64) {}
}

/// Builder for [`ApiService`].
pub struct ApiServiceBuilder {
	config: ApiServiceConfig,
	transport: Option<Arc<dyn Transport>>,
	routing: Option<Arc<dyn RoutingResolver>>,
	store: Option<Arc<dyn CredentialStore>>,
	authenticator: Option<Arc<dyn SessionAuthenticator>>,
	session_id: Option<String>,
	verification_delegate: Option<Arc<dyn HumanVerificationDelegate>>,
	upgrade_delegate: Option<Arc<dyn ForceUpgradeDelegate>>,
	service_delegate: Option<Arc<dyn ServiceDelegate>>,
	handlers: Vec<Arc<dyn EventHandler>>,
}

impl ApiServiceBuilder {
	pub fn new() -> Self {
		Self {
			config: ApiServiceConfig::default(),
			transport: None,
			routing: None,
			store: None,
			authenticator: None,
			session_id: None,
			verification_delegate: None,
			upgrade_delegate: None,
			service_delegate: None,
			handlers: Vec::new(),
		}
	}

	pub fn with_config(mut self, config: ApiServiceConfig) -> Self {
		self.config = config;
		self
	}

	/// Single fixed base URL, e.g. `https://mail.example.com/api`.
	pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
		self.routing = Some(Arc::new(StaticRouting::new(base_url)));
		self
	}

	pub fn with_routing(mut self, routing: Arc<dyn RoutingResolver>) -> Self {
		self.routing = Some(routing);
		self
	}

	pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
		self.transport = Some(transport);
		self
	}

	pub fn with_credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
		self.store = Some(store);
		self
	}

	/// Replace the HTTP authenticator, mostly for tests.
	pub fn with_authenticator(mut self, authenticator: Arc<dyn SessionAuthenticator>) -> Self {
		self.authenticator = Some(authenticator);
		self
	}

	pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
		self.session_id = Some(session_id.into());
		self
	}

	pub fn with_human_verification_delegate(mut self, delegate: Arc<dyn HumanVerificationDelegate>) -> Self {
		self.verification_delegate = Some(delegate);
		self
	}

	pub fn with_force_upgrade_delegate(mut self, delegate: Arc<dyn ForceUpgradeDelegate>) -> Self {
		self.upgrade_delegate = Some(delegate);
		self
	}

	pub fn with_service_delegate(mut self, delegate: Arc<dyn ServiceDelegate>) -> Self {
		self.service_delegate = Some(delegate);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn disable_metrics(mut self) -> Self {
		self.config.enable_metrics = false;
		self
	}

	pub fn build(self) -> ApiResult<ApiService> {
		self.config.validate()?;

		let Some(routing) = self.routing else {
			return Err(ConfigError::Invalid("no base URL or routing resolver configured".into()).into());
		};

		let transport: Arc<dyn Transport> = match self.transport {
			Some(transport) => transport,
			None => Arc::new(ReqwestTransport::new().map_err(ApiError::Transport)?),
		};

		let metrics = self.config.enable_metrics.then(MetricsCollector::new);
		let mut events = EventDispatcher::new();
		events.register_handler(Arc::new(LoggingHandler));
		if let Some(ref collector) = metrics {
			events.register_handler(Arc::new(MetricsHandler::new(collector.clone())));
		}
		for handler in self.handlers {
			events.register_handler(handler);
		}
		let events = Arc::new(events);

		let identity = identity_for(&self.config, self.service_delegate.as_deref());
		let authenticator: Arc<dyn SessionAuthenticator> = match self.authenticator {
			Some(authenticator) => authenticator,
			None => Arc::new(HttpSessionAuthenticator::new(
				transport.clone(),
				routing.clone(),
				identity,
				self.config.refresh_path.clone(),
				self.config.sessions_path.clone(),
				self.config.default_timeout(routing.is_active()),
			)),
		};

		let credentials = CredentialCoordinator::new(
			self.store,
			authenticator,
			self.config.support_unauthenticated_sessions,
			events.clone(),
		);
		if let Some(session_id) = self.session_id {
			credentials.set_session_id(session_id);
		}

		let challenges = ChallengeCoordinator::new(
			self.verification_delegate,
			self.upgrade_delegate,
			events.clone(),
		);

		Ok(ApiService {
			config: self.config,
			transport,
			routing,
			credentials,
			challenges,
			service_delegate: self.service_delegate,
			metrics,
			events,
		})
	}
}

impl Default for ApiServiceBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Executes logical requests against the backend.
///
/// Cheap to clone; clones share credentials, challenge sessions, and metrics.
#[derive(Clone)]
pub struct ApiService {
	config: ApiServiceConfig,
	transport: Arc<dyn Transport>,
	routing: Arc<dyn RoutingResolver>,
	credentials: CredentialCoordinator,
	challenges: ChallengeCoordinator,
	service_delegate: Option<Arc<dyn ServiceDelegate>>,
	metrics: Option<MetricsCollector>,
	events: Arc<EventDispatcher>,
}

/// Mutable state of one logical request across its internal retries.
struct RetryState {
	auth_retries_left: u32,
	credential: Option<Credential>,
	challenge_headers: HashMap<String, String>,
	ticket: Option<VerificationTicket>,
	attempt: u32,
}

impl ApiService {
	pub fn builder() -> ApiServiceBuilder {
		ApiServiceBuilder::new()
	}

	pub fn config(&self) -> &ApiServiceConfig {
		&self.config
	}

	pub fn credentials(&self) -> &CredentialCoordinator {
		&self.credentials
	}

	pub fn challenges(&self) -> &ChallengeCoordinator {
		&self.challenges
	}

	pub fn session_id(&self) -> String {
		self.credentials.session_id()
	}

	pub fn set_session_id(&self, session_id: impl Into<String>) {
		self.credentials.set_session_id(session_id);
	}

	/// Metrics snapshot, `None` when metrics are disabled.
	pub fn metrics(&self) -> Option<MetricsSnapshot> {
		self.metrics.as_ref().map(MetricsCollector::snapshot)
	}

	/// Make sure a session exists, acquiring an anonymous one if needed.
	pub async fn acquire_session_if_needed(&self) -> ApiResult<Credential> {
		match self.credentials.fetch_or_acquire().await {
			AcquisitionOutcome::FoundExisting(credential) | AcquisitionOutcome::Acquired(credential) => {
				Ok(credential)
			}
			AcquisitionOutcome::Failed(error) => Err(ApiError::Application(error)),
			AcquisitionOutcome::Misconfigured => Err(ApiError::LocalConfiguration),
		}
	}

	/// Execute one logical request.
	pub async fn execute(&self, spec: RequestSpec) -> ApiResult<ApiResponse> {
		let started = Instant::now();
		let result = self.run(&spec).await;

		let path = spec.bare_path().to_string();
		if let Err(ref error) = result {
			self.events.dispatch(ServiceEvent::Error(ErrorEvent {
				path: path.clone(),
				error: error.to_string(),
				timestamp: chrono::Utc::now(),
			}));
		}
		self.events.dispatch(ServiceEvent::Completed(CompletedEvent {
			path,
			success: result.is_ok(),
			latency: started.elapsed(),
			timestamp: chrono::Utc::now(),
		}));
		result
	}

	/// Execute and decode the body into `T`.
	pub async fn execute_decoded<T: serde::de::DeserializeOwned>(&self, spec: RequestSpec) -> ApiResult<T> {
		let response = self.execute(spec).await?;
		response.decode().map_err(|err| {
			ApiError::Application(
				ResponseError::new(Some(response.status()), response.code(), "Malformed response")
					.with_underlying(err.to_string()),
			)
		})
	}

	async fn run(&self, spec: &RequestSpec) -> ApiResult<ApiResponse> {
		let mut state = RetryState {
			auth_retries_left: self.config.auth_retry_budget,
			credential: self.initial_credential(spec).await?,
			challenge_headers: HashMap::new(),
			ticket: None,
			attempt: 0,
		};

		let result = self.drive(spec, &mut state).await;
		// Any outcome other than a rejection code counts as past verification.
		if let Some(ticket) = state.ticket.take() {
			ticket.accept().await;
		}
		result
	}

	async fn drive(&self, spec: &RequestSpec, state: &mut RetryState) -> ApiResult<ApiResponse> {
		loop {
			state.attempt += 1;
			let response = self
				.send_with_routing(spec, state.credential.as_ref(), &state.challenge_headers)
				.await?;
			let body = response.json().unwrap_or(Value::Null);

			let rejected = body_code(&body).is_some_and(codes::is_verification_rejection);
			if rejected && let Some(ticket) = state.ticket.take() {
				let error = ResponseError::from_body(Some(response.status), &body);
				let resolution = ticket.reject(&error, &body).await;
				match self.follow_challenge(spec, &response, resolution, state)? {
					Some(delivered) => return Ok(delivered),
					None => continue,
				}
			}

			let authenticated = state.credential.is_some();
			match classify(
				Some(response.status),
				body_code(&body),
				body_error(&body),
				None,
				authenticated,
			) {
				Classification::Success => {
					return Ok(ApiResponse::new(response.status, response.headers, body));
				}
				Classification::TerminalFailure(error) => return Err(ApiError::Application(error)),
				Classification::TransportRetryable => {
					return Err(ApiError::Application(ResponseError::from_body(
						Some(response.status),
						&body,
					)));
				}
				Classification::AuthExpired => {
					let Some(failed) = state.credential.take() else {
						return Err(ApiError::CredentialNotFound);
					};
					if self.config.is_refresh_path(&spec.path)
						|| !spec.auth_retry
						|| state.auth_retries_left == 0
					{
						return Err(ApiError::Application(expired_error(response.status, &body)));
					}
					state.auth_retries_left -= 1;
					state.credential = Some(self.refresh_credential(&failed).await?);
					self.events
						.retry(spec.bare_path(), state.attempt, RetryReason::AuthRefresh);
				}
				Classification::ChallengeRequired(kind) => {
					let resolution = self
						.challenges
						.resolve(
							kind,
							ChallengeContext {
								body: &body,
								http_status: Some(response.status),
								path: &spec.path,
							},
						)
						.await;
					if let Some(delivered) = self.follow_challenge(spec, &response, resolution, state)? {
						return Ok(delivered);
					}
				}
			}
		}
	}

	/// Apply a challenge resolution. `Ok(None)` means "go around again".
	fn follow_challenge(
		&self,
		spec: &RequestSpec,
		response: &TransportResponse,
		resolution: ChallengeResolution,
		state: &mut RetryState,
	) -> ApiResult<Option<ApiResponse>> {
		match resolution {
			ChallengeResolution::RetryWithHeaders { headers, ticket } => {
				if ticket.is_none() {
					// Released from behind another request's verification.
					if state.auth_retries_left == 0 {
						let body = response.json().unwrap_or(Value::Null);
						return Err(ApiError::Application(ResponseError::from_body(
							Some(response.status),
							&body,
						)));
					}
					state.auth_retries_left -= 1;
				}
				state.challenge_headers = headers;
				state.ticket = ticket;
				self.events
					.retry(spec.bare_path(), state.attempt, RetryReason::Verification);
				Ok(None)
			}
			ChallengeResolution::Abort(error) => Err(ApiError::Application(error)),
			ChallengeResolution::AbortWithSubstituteResponse(body) => {
				match body_code(&body) {
					Some(code) if !codes::is_success(code) => Err(ApiError::Application(
						ResponseError::from_body(Some(response.status), &body),
					)),
					_ => Ok(Some(ApiResponse::new(
						response.status,
						response.headers.clone(),
						body,
					))),
				}
			}
		}
	}

	async fn initial_credential(&self, spec: &RequestSpec) -> ApiResult<Option<Credential>> {
		if let Some(ref credential) = spec.explicit_credential {
			return Ok(Some(credential.clone()));
		}
		if !spec.requires_auth {
			return Ok(None);
		}

		let session_id = self.credentials.session_id();
		match self.credentials.fetch(&session_id).await {
			FetchResult::Found(credential) => Ok(Some(credential)),
			FetchResult::NotFound => Err(ApiError::CredentialNotFound),
			FetchResult::Misconfigured => Err(ApiError::LocalConfiguration),
		}
	}

	async fn refresh_credential(&self, failed: &Credential) -> ApiResult<Credential> {
		let outcome = self
			.credentials
			.refresh(&failed.session_id, failed, self.config.refresh_attempts)
			.await;
		match outcome {
			RefreshOutcome::Refreshed(credential)
			| RefreshOutcome::UnauthenticatedSessionReacquired(credential) => Ok(credential),
			RefreshOutcome::SessionInvalidated(error) => Err(ApiError::SessionInvalidated(error)),
			RefreshOutcome::TransientFailure(RefreshFailure::TooManyAttempts) => {
				Err(ApiError::TooManyRefreshAttempts)
			}
			RefreshOutcome::TransientFailure(RefreshFailure::NoCredential) => Err(ApiError::CredentialNotFound),
			RefreshOutcome::TransientFailure(RefreshFailure::Backend(error)) => Err(ApiError::RefreshFailed(error)),
			RefreshOutcome::Misconfigured => Err(ApiError::LocalConfiguration),
		}
	}

	/// Send one attempt, switching routes on solvable transport failures.
	async fn send_with_routing(
		&self,
		spec: &RequestSpec,
		credential: Option<&Credential>,
		challenge_headers: &HashMap<String, String>,
	) -> ApiResult<TransportResponse> {
		let mut routing_retries = 0u32;

		loop {
			let base_url = self.routing.current_base_url();
			let request = self.prepare_request(spec, credential, challenge_headers, &base_url)?;
			let url = request.url.clone();

			self.events.dispatch(ServiceEvent::PreRequest(PreRequestEvent {
				url: url.clone(),
				method: spec.method.clone(),
				authenticated: credential.is_some(),
				timestamp: chrono::Utc::now(),
			}));

			let started = Instant::now();
			let error = match self.transport.send(request).await {
				Ok(response) => {
					self.events.dispatch(ServiceEvent::PostResponse(PostResponseEvent {
						url,
						method: spec.method.clone(),
						status: response.status,
						latency: started.elapsed(),
						timestamp: chrono::Utc::now(),
					}));
					self.routing.on_request_completed(&base_url);
					if let Some(delegate) = self.service_delegate.as_deref()
						&& let Some(date) = response.server_date()
					{
						delegate.on_update_server_time(date.timestamp());
					}
					return Ok(response);
				}
				Err(error) => error,
			};

			let solvable = self.routing.is_routing_solvable_error(&error);
			let fault = TransportFault {
				error: &error,
				routing_solvable: solvable && routing_retries < self.config.max_routing_retries,
			};
			if classify(None, None, None, Some(fault), credential.is_some()) != Classification::TransportRetryable {
				if solvable {
					log::warn!("Routing retries exhausted for {}: {}", spec.bare_path(), error);
				}
				return Err(ApiError::Transport(error));
			}

			let should_retry = self.routing.resolve_routing_error(&error, &base_url).await;
			self.routing.on_routing_error_resolved(should_retry);
			if !should_retry {
				return Err(ApiError::PotentiallyBlocked(error));
			}

			routing_retries += 1;
			self.events
				.retry(spec.bare_path(), routing_retries, RetryReason::Routing);
		}
	}

	fn prepare_request(
		&self,
		spec: &RequestSpec,
		credential: Option<&Credential>,
		challenge_headers: &HashMap<String, String>,
		base_url: &str,
	) -> ApiResult<TransportRequest> {
		let identity = identity_for(&self.config, self.service_delegate.as_deref());
		let routing_headers = self.routing.routing_headers();
		let headers = compose_headers(
			&identity,
			HeaderLayers {
				credential,
				routing: &routing_headers,
				caller: &spec.headers,
				challenge: challenge_headers,
			},
		)
		.map_err(|err| ApiError::InvalidRequest(err.to_string()))?;

		let timeout = spec
			.timeout
			.unwrap_or_else(|| self.config.default_timeout(self.routing.is_active()));
		build_request(base_url, spec, headers, timeout)
			.map_err(|err| ApiError::InvalidRequest(err.to_string()))
	}
}

impl std::fmt::Debug for ApiService {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ApiService")
			.field("config", &self.config)
			.field("credentials", &self.credentials)
			.field("challenges", &self.challenges)
			.field("metrics_enabled", &self.metrics.is_some())
			.finish()
	}
}

fn identity_for(config: &ApiServiceConfig, delegate: Option<&dyn ServiceDelegate>) -> ClientIdentity {
	let Some(delegate) = delegate else {
		return config.identity();
	};
	let mut additional_headers = config.additional_headers.clone();
	additional_headers.extend(delegate.additional_headers());
	ClientIdentity {
		app_version: delegate.app_version(),
		user_agent: delegate.user_agent().or_else(|| config.user_agent.clone()),
		locale: delegate.locale(),
		additional_headers,
	}
}

fn expired_error(status: u16, body: &Value) -> ResponseError {
	let message = body_error(body)
		.filter(|message| !message.is_empty())
		.unwrap_or("Authentication expired");
	ResponseError::new(Some(status), body_code(body), message)
}
