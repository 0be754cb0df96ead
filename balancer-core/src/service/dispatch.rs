use crate::app::dispatch::BalancerApp;
use crate::error::BalancerError;
use pingora::proxy::{http_proxy_service, HttpProxy};
use pingora::server::configuration::ServerConf;
use pingora::services::listening::Service;
use std::sync::Arc;

/// Creates the balancing service listening for plain HTTP on `addr`.
///
/// # Arguments
/// * `conf` - The server configuration the service runs under.
/// * `app` - The dispatch application handling every exchange.
/// * `addr` - The address the public listener binds.
pub fn balancer_service(
    conf: &Arc<ServerConf>,
    app: BalancerApp,
    addr: &str,
) -> Service<HttpProxy<BalancerApp>> {
    let mut service = http_proxy_service(conf, app);
    service.add_tcp(addr);
    service
}

/// Creates the balancing service terminating TLS on `addr` with the supplied
/// certificate and key.
///
/// # Arguments
/// * `conf` - The server configuration the service runs under.
/// * `app` - The dispatch application handling every exchange.
/// * `addr` - The address the public listener binds.
/// * `cert_path` - The file path to the TLS certificate.
/// * `key_path` - The file path to the corresponding private key.
pub fn balancer_service_tls(
    conf: &Arc<ServerConf>,
    app: BalancerApp,
    addr: &str,
    cert_path: &str,
    key_path: &str,
) -> Result<Service<HttpProxy<BalancerApp>>, BalancerError> {
    let mut service = http_proxy_service(conf, app);
    service
        .add_tls(addr, cert_path, key_path)
        .map_err(|e| BalancerError::Config(format!("failed to set up the TLS listener: {e}")))?;
    Ok(service)
}
