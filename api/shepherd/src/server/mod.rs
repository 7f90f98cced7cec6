//! The server module owns the device-facing API surface.  It interfaces with the fleet store
//! through the server::controller module, and admits peers through server::verifier.

mod controller;
mod error;
mod verifier;

pub use controller::{Endpoint, RetryPolicy};
pub use error::Error;
pub use verifier::{capture_peer_certificates, PeerCertificates, RouteRole, VerifiedPeer};

use actix_web::body::BoxBody;
use actix_web::{
    web, App, Either, HttpRequest, HttpResponse, HttpServer, Responder, ResponseError,
};
use error::Result;
use log::{debug, info};
use models::messages::Message;
use snafu::ResultExt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::certificates::CertificateAuthority;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub http_port: u16,
    pub readiness_bind: SocketAddr,
    pub request_timeout: Duration,
}

/// End-to-end deadline for a single request.
#[derive(Debug, Clone, Copy)]
struct RequestTimeout(Duration);

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

// Router

/// This is the primary interface of the module.  It starts the mutual-TLS device server and the
/// plain readiness server, and runs both until one fails or `stop` resolves, at which point both
/// are stopped gracefully.
pub async fn serve<F>(
    endpoint: Arc<Endpoint>,
    ca: Arc<CertificateAuthority>,
    tls: rustls::ServerConfig,
    settings: &ServerSettings,
    stop: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    let endpoint = web::Data::from(endpoint);
    let ca = web::Data::from(ca);
    let timeout = web::Data::new(RequestTimeout(settings.request_timeout));

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.http_port));
    let device_server = HttpServer::new(move || {
        App::new()
            .app_data(json_config())
            .app_data(endpoint.clone())
            .app_data(ca.clone())
            .app_data(timeout.clone())
            .configure(routes)
    })
    // The peer's certificates are only visible while accepting the connection; keep them for
    // the verifier.
    .on_connect(capture_peer_certificates)
    .bind_rustls_021(addr, tls)
    .context(error::BindSocketSnafu { addr })?
    .run();
    info!("Serving devices on {}", addr);

    // Bound after the device server, so answering means the device server is up.
    let readiness_addr = settings.readiness_bind;
    let readiness_server = HttpServer::new(|| App::new().configure(readiness_routes))
        .workers(1)
        .bind(readiness_addr)
        .context(error::BindSocketSnafu {
            addr: readiness_addr,
        })?
        .run();
    info!("Serving readiness checks on {}", readiness_addr);

    let device_handle = device_server.handle();
    let readiness_handle = readiness_server.handle();
    let running = futures::future::try_join(device_server, readiness_server);
    futures::pin_mut!(running);

    tokio::select! {
        result = &mut running => {
            result.context(error::ServerStartSnafu)?;
        }
        () = stop => {
            info!("Stopping servers");
            let stopping = async {
                device_handle.stop(true).await;
                readiness_handle.stop(true).await;
            };
            let ((), result) = tokio::join!(stopping, &mut running);
            result.context(error::ServerStartSnafu)?;
        }
    }
    Ok(())
}

fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/control")
            .route("/{device_id}", web::get().to(get_control))
            .route("/{device_id}", web::post().to(post_control)),
    )
    .service(
        web::scope("/data")
            .route("/{device_id}", web::get().to(get_data))
            .route("/{device_id}", web::post().to(post_data)),
    );
}

fn readiness_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/healthz", web::get().to(ready))
        .route("/readyz", web::get().to(ready));
}

/// If actix rejects a body before it reaches a handler, it never goes through our
/// ResponseError; this makes those rejections 400s with the reason in the body.
fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .content_type_required(false)
        .error_handler(|err, _req| {
            error::Error::MalformedBody {
                reason: err.to_string(),
            }
            .into()
        })
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

// Handler methods called by the router.  The VerifiedPeer argument comes first so a rejected
// peer gets its 401 before anything else about the request is looked at.

async fn get_control(
    _peer: VerifiedPeer,
    device_id: web::Path<String>,
    endpoint: web::Data<Endpoint>,
    timeout: web::Data<RequestTimeout>,
) -> Result<Either<MessageResponse, HttpResponse>> {
    debug!("Control pull from '{}'", device_id);
    let reply = deadline(&timeout, endpoint.get_control(&device_id)).await?;
    Ok(reply_or_empty(reply))
}

async fn post_control(
    _peer: VerifiedPeer,
    device_id: web::Path<String>,
    message: web::Json<Message>,
    endpoint: web::Data<Endpoint>,
) -> HttpResponse {
    endpoint.post_control(&device_id, &message);
    HttpResponse::Ok().finish()
}

async fn get_data(
    _peer: VerifiedPeer,
    device_id: web::Path<String>,
    endpoint: web::Data<Endpoint>,
    timeout: web::Data<RequestTimeout>,
) -> Result<MessageResponse> {
    debug!("Data pull from '{}'", device_id);
    let message = deadline(&timeout, endpoint.get_data(&device_id)).await?;
    Ok(MessageResponse(message))
}

async fn post_data(
    peer: VerifiedPeer,
    device_id: web::Path<String>,
    message: web::Json<Message>,
    endpoint: web::Data<Endpoint>,
    timeout: web::Data<RequestTimeout>,
) -> Result<Either<MessageResponse, HttpResponse>> {
    let message = message.into_inner();
    debug!("'{}' pushed '{}'", device_id, message.directive);
    let reply = deadline(&timeout, endpoint.post_data(&device_id, &peer, message)).await?;
    Ok(reply_or_empty(reply))
}

async fn ready() -> HttpResponse {
    HttpResponse::Ok().finish()
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

// Helpers for handler methods called by the router

/// Runs a handler body under the request deadline.  Dropping the body on expiry abandons any
/// store call it's waiting on.
async fn deadline<T, F>(timeout: &RequestTimeout, body: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout.0, body)
        .await
        .context(error::DeadlineSnafu {
            seconds: timeout.0.as_secs(),
        })?
}

fn reply_or_empty(reply: Option<Message>) -> Either<MessageResponse, HttpResponse> {
    match reply {
        Some(message) => Either::Left(MessageResponse(message)),
        None => Either::Right(HttpResponse::Ok().finish()),
    }
}

/// Helper macro for implementing the actix-web Responder trait for a type.
/// $for: the type for which we implement Responder.
/// $self: just pass "self"  (macro hygiene requires this)
/// $serialize_expr: the thing to serialize for a response; this is just "self" again if $for
///    implements Serialize, or is "self.0" for a newtype over something implementing Serialize
macro_rules! impl_responder_for {
    ($for:ident, $self:ident, $serialize_expr:expr) => (
        impl Responder for $for {
            type Body = BoxBody;

            fn respond_to($self, _req: &HttpRequest) -> HttpResponse<Self::Body> {
                match serde_json::to_string(&$serialize_expr) {
                    Ok(body) => HttpResponse::Ok()
                        .content_type("application/json")
                        .body(body),
                    Err(source) => error::Error::ResponseSerialization { source }.error_response(),
                }
            }
        }
    )
}

/// This lets us respond from our handler methods with a Message (or Result<Message>)
struct MessageResponse(Message);
impl_responder_for!(MessageResponse, self, self.0);
