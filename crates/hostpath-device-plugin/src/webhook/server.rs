use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use futures::Future;
use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::AdmissionRequest;
use kube::core::admission::AdmissionResponse;
use kube::core::admission::AdmissionReview;
use kube::core::DynamicObject;
use poem::get;
use poem::handler;
use poem::listener::Listener;
use poem::listener::RustlsCertificate;
use poem::listener::RustlsConfig;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::post;
use poem::web::Data;
use poem::web::Json;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::HostPathMutator;
use super::WebhookError;
use crate::config::WebhookArgs;

#[handler]
async fn ping() -> &'static str {
    "ok"
}

#[handler]
async fn mutate_endpoint(
    Json(review): Json<AdmissionReview<DynamicObject>>,
    Data(mutator): Data<&HostPathMutator>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(review_pod(mutator, &request).into_review())
}

/// Routes served by the webhook: probes on `/` and `/healthz`, reviews on
/// `POST /mutating`.
pub fn routes(mutator: HostPathMutator) -> impl Endpoint {
    Route::new()
        .at("/", get(ping))
        .at("/healthz", get(ping))
        .at("/mutating", post(mutate_endpoint))
        .data(mutator)
        .with(Tracing)
}

/// Answers one admission request. Objects other than core/v1 pods are
/// allowed unchanged.
pub fn review_pod(
    mutator: &HostPathMutator,
    request: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let uid = request.uid.as_str();
    let allow = || AdmissionResponse::from(request);

    if !(request.kind.group.is_empty() && request.kind.kind == "Pod") {
        debug!(uid, kind = %request.kind.kind, "not a pod, allowing unchanged");
        return allow();
    }
    let Some(object) = request.object.as_ref() else {
        debug!(uid, "no object in request, allowing unchanged");
        return allow();
    };

    let original = match serde_json::to_value(object) {
        Ok(value) => value,
        Err(e) => return allow().deny(format!("failed to encode pod: {e}")),
    };
    let pod: Pod = match serde_json::from_value(original) {
        Ok(pod) => pod,
        Err(e) => {
            warn!(uid, error = %e, "failed to decode pod");
            return allow().deny(format!("failed to decode pod: {e}"));
        }
    };
    let before = match serde_json::to_value(&pod) {
        Ok(value) => value,
        Err(e) => return allow().deny(format!("failed to encode pod: {e}")),
    };

    let mutated = match mutator.mutate(&request.operation, pod) {
        Ok(mutated) => mutated,
        Err(conflict) => {
            info!(uid, pod = ?object.metadata.name, "denied: {conflict}");
            return allow().deny(conflict.to_string());
        }
    };
    let after = match serde_json::to_value(&mutated) {
        Ok(value) => value,
        Err(e) => return allow().deny(format!("failed to encode pod: {e}")),
    };

    let patch = json_patch::diff(&before, &after);
    if patch.0.is_empty() {
        return allow();
    }
    info!(uid, pod = ?object.metadata.name, operations = patch.0.len(), "patching pod");
    match allow().with_patch(patch) {
        Ok(response) => response,
        Err(e) => {
            error!(uid, error = %e, "failed to serialize patch");
            allow().deny(format!("patch serialization error: {e}"))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TlsMaterial {
    cert: Vec<u8>,
    key: Vec<u8>,
}

impl TlsMaterial {
    async fn load(cert_file: &Path, key_file: &Path) -> Result<Self, Report<WebhookError>> {
        let read = |path: &Path| {
            let path = path.to_path_buf();
            async move {
                tokio::fs::read(&path).await.change_context(WebhookError::Tls {
                    path: path.display().to_string(),
                })
            }
        };
        Ok(Self {
            cert: read(cert_file).await?,
            key: read(key_file).await?,
        })
    }

    fn rustls_config(&self) -> RustlsConfig {
        RustlsConfig::new().fallback(
            RustlsCertificate::new()
                .cert(self.cert.clone())
                .key(self.key.clone()),
        )
    }
}

/// HTTPS server for the admission webhook.
pub struct WebhookServer {
    mutator: HostPathMutator,
    args: WebhookArgs,
}

impl WebhookServer {
    pub fn new(mutator: HostPathMutator, args: WebhookArgs) -> Self {
        Self { mutator, args }
    }

    /// Serves until `shutdown` resolves, then drains in-flight requests for
    /// up to the graceful shutdown timeout.
    ///
    /// # Errors
    ///
    /// - [`WebhookError::Tls`] if the certificate or key cannot be read
    /// - [`WebhookError::Server`] if the listener fails
    pub async fn run(
        self,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<(), Report<WebhookError>> {
        let listen = self.args.listen.clone();
        let tcp = TcpListener::bind(listen.clone());

        let listener = if self.args.insecure_http {
            warn!("serving the webhook over plain HTTP on {listen}");
            tcp.boxed()
        } else {
            let cert_file = self.args.tls_cert_file.clone();
            let key_file = self.args.tls_private_key_file.clone();
            let initial = TlsMaterial::load(&cert_file, &key_file).await?;
            let reload_interval = Duration::from_secs(self.args.tls_reload_interval.max(1));
            info!("serving the webhook over HTTPS on {listen}");
            tcp.rustls(Box::pin(tls_config_stream(
                initial,
                cert_file,
                key_file,
                reload_interval,
            )))
            .boxed()
        };

        let app = routes(self.mutator);
        let timeout = Duration::from_secs(self.args.graceful_shutdown_timeout);
        Server::new(listener)
            .run_with_graceful_shutdown(app, shutdown, Some(timeout))
            .await
            .change_context(WebhookError::Server { listen })?;

        info!("webhook server stopped");
        Ok(())
    }
}

/// Yields the initial TLS config, then a new one whenever the files on disk
/// change. Read failures keep the current config.
fn tls_config_stream(
    initial: TlsMaterial,
    cert_file: PathBuf,
    key_file: PathBuf,
    reload_interval: Duration,
) -> impl futures::Stream<Item = RustlsConfig> + Send + 'static {
    async_stream::stream! {
        let mut current = initial;
        yield current.rustls_config();

        let mut ticker = tokio::time::interval(reload_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match TlsMaterial::load(&cert_file, &key_file).await {
                Ok(material) if material != current => {
                    info!("TLS certificate changed, reloading");
                    current = material;
                    yield current.rustls_config();
                }
                Ok(_) => {}
                Err(e) => warn!("failed to reload TLS material: {e:?}"),
            }
        }
    }
}
