/*!
# Background

Edge devices are managed declaratively: an operator writes `Device` and `Deployment` records into
a shared desired-state store, and each device keeps itself in step by talking to this endpoint
over mutual TLS.  A device first registers with a shared registration certificate and gets back
a certificate of its own.  From then on it pulls the configuration assembled for it, reports its
health through periodic heartbeats, and polls for commands such as disconnect.

# Library

The [`server`] module is the device-facing HTTPS API.  Requests are admitted by
`server::verifier`, which checks the peer certificate captured during the TLS handshake against
the route and the device it names.  `server::controller` implements the device lifecycle:
registration, heartbeats, configuration pulls and the decommission handshake driven by record
finalizers.

Supporting modules:
* [`certificates`] keeps the certificate authority, the server certificate and the shared
  registration bundle, and signs device certificate requests.
* [`assembler`] builds a device's configuration message from its deployments and the config maps
  and secrets they reference, with [`references`] working out which of those are mandatory.
* [`storage`] resolves object storage for devices that ask for it.
* [`events`] and [`metrics`] record what happens to devices.
* [`config`] reads the process configuration file.

The store itself is reached through the `fleetstore::Repository` trait.

# Current limitations

* Device and server leaves always get ECDSA keys; only the root is RSA.
* Metrics are counted in process but not served.
*/

#![deny(rust_2018_idioms)]

pub mod assembler;
pub mod certificates;
pub mod config;
pub mod events;
pub mod metrics;
pub mod references;
pub mod server;
pub mod storage;

pub use server::serve;
