//! Decides whether the TLS peer of a request may use the route it asked for.
//!
//! The peer's certificates are captured from the TLS session when the connection is accepted,
//! see [`capture_peer_certificates`].  Handlers take a [`VerifiedPeer`] argument; extracting it
//! checks those certificates against the CA and the route, and answers 401 otherwise.

use actix_tls::accept::rustls_0_21::TlsStream;
use actix_web::dev::{Extensions, Payload};
use actix_web::http::Method;
use actix_web::rt::net::TcpStream;
use actix_web::{web, FromRequest, HttpRequest};
use futures::future::{ready, Ready};
use log::{error, warn};
use std::any::Any;

use super::error::{self, Error, Result};
use crate::certificates::{CertificateAuthority, Peer, Role};

/// DER certificates the TLS peer presented, leaf first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCertificates(pub Vec<Vec<u8>>);

/// Connection hook storing the peer's certificates in the connection data, where
/// [`VerifiedPeer`] finds them.
pub fn capture_peer_certificates(conn: &dyn Any, data: &mut Extensions) {
    if let Some(tls) = conn.downcast_ref::<TlsStream<TcpStream>>() {
        let (_, session) = tls.get_ref();
        if let Some(certs) = session.peer_certificates() {
            data.insert(PeerCertificates(
                certs.iter().map(|cert| cert.0.clone()).collect(),
            ));
        }
    }
}

/// Who a route admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteRole {
    /// Only registered devices.
    Device,
    /// Devices pushing data: the shared registration certificate or a device's own.  Each
    /// directive narrows this further.
    Registration,
}

impl RouteRole {
    pub fn for_request(method: &Method, path: &str) -> Option<Self> {
        if path.starts_with("/control/") {
            Some(RouteRole::Device)
        } else if path.starts_with("/data/") {
            if method == Method::POST {
                Some(RouteRole::Registration)
            } else {
                Some(RouteRole::Device)
            }
        } else {
            None
        }
    }

    fn admits(self, role: Role) -> bool {
        match self {
            RouteRole::Device => role == Role::Device,
            RouteRole::Registration => true,
        }
    }
}

/// An authenticated peer admitted to the route it requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPeer {
    pub peer: Peer,
}

impl VerifiedPeer {
    pub fn role(&self) -> Role {
        self.peer.role()
    }
}

/// Checks a peer chain against a route.  A device certificate is only good for its own
/// `{device_id}`.
pub fn verify_peer(
    ca: &CertificateAuthority,
    route: RouteRole,
    device_id: Option<&str>,
    chain: &[Vec<u8>],
) -> Result<VerifiedPeer> {
    let peer = ca.authenticate(chain).ok_or(Error::Unauthorized)?;
    if !route.admits(peer.role()) {
        warn!(
            "Rejecting '{}': certificate role not admitted to {:?} route",
            peer.common_name, route
        );
        return error::UnauthorizedSnafu.fail();
    }
    if peer.role() == Role::Device && device_id != Some(peer.common_name.as_str()) {
        warn!(
            "Rejecting '{}': certificate used for device '{}'",
            peer.common_name,
            device_id.unwrap_or_default()
        );
        return error::UnauthorizedSnafu.fail();
    }
    Ok(VerifiedPeer { peer })
}

fn verify_request(req: &HttpRequest) -> Result<VerifiedPeer> {
    let ca = match req.app_data::<web::Data<CertificateAuthority>>() {
        Some(ca) => ca,
        None => {
            error!("No certificate authority configured; rejecting request");
            return error::UnauthorizedSnafu.fail();
        }
    };
    let route =
        RouteRole::for_request(req.method(), req.path()).ok_or(Error::Unauthorized)?;
    let certs = req
        .conn_data::<PeerCertificates>()
        .ok_or(Error::Unauthorized)?;
    verify_peer(ca, route, req.match_info().get("device_id"), &certs.0)
}

impl FromRequest for VerifiedPeer {
    type Error = Error;
    type Future = Ready<Result<Self>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(verify_request(req))
    }
}
