//! Ordered host-discovery probes. The first probe with an answer wins.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use tracing::{debug, warn};

use crate::config::EndpointSettings;
use crate::exec::{EngineExec, shell_quote};

pub trait Probe: Send + Sync {
    fn name(&self) -> &str;

    fn probe(&self) -> BoxFuture<'_, Option<String>>;
}

/// Walk `probes` in order and return the first non-empty answer, together
/// with the name of the probe that produced it.
pub async fn first_hit(probes: &[Box<dyn Probe>]) -> Option<(String, String)> {
    for probe in probes {
        match probe.probe().await {
            Some(value) => {
                debug!(probe = probe.name(), value = %value, "probe answered");
                return Some((probe.name().to_string(), value));
            }
            None => debug!(probe = probe.name(), "probe had no answer"),
        }
    }
    None
}

fn clean(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty() && !value.contains(char::is_whitespace)).then(|| value.to_string())
}

/// First whitespace-separated token of the output.
pub fn first_token(out: &str) -> Option<String> {
    out.split_whitespace().next().and_then(clean)
}

/// First token that parses as an IPv4 address.
pub fn first_ipv4(out: &str) -> Option<String> {
    out.split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .find(|tok| tok.parse::<std::net::Ipv4Addr>().is_ok())
        .map(str::to_string)
}

// -- Probes --

pub struct StaticProbe {
    name: String,
    value: Option<String>,
}

impl StaticProbe {
    pub fn new(name: &str, value: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            value: value.and_then(clean),
        }
    }
}

impl Probe for StaticProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn probe(&self) -> BoxFuture<'_, Option<String>> {
        Box::pin(async move { self.value.clone() })
    }
}

/// Run a shell command inside an engine and parse its stdout.
pub struct EngineCommandProbe<E> {
    name: String,
    exec: Arc<E>,
    engine: String,
    command: String,
    parse: fn(&str) -> Option<String>,
}

impl<E: EngineExec> EngineCommandProbe<E> {
    pub fn new(
        name: &str,
        exec: Arc<E>,
        engine: &str,
        command: String,
        parse: fn(&str) -> Option<String>,
    ) -> Self {
        Self {
            name: name.to_string(),
            exec,
            engine: engine.to_string(),
            command,
            parse,
        }
    }

    /// Ask a public lookup service from inside the engine, with curl or wget.
    pub fn public_ip(exec: Arc<E>, engine: &str, url: &str) -> Self {
        let url = shell_quote(url);
        let command = format!(
            "(command -v curl >/dev/null && curl -fsS --max-time 3 {url} || wget -qO- --timeout=3 {url}) 2>/dev/null | tr -d '\\r' | head -n1"
        );
        Self::new("engine-public-ip", exec, engine, command, first_ipv4)
    }

    /// The engine's own first address.
    pub fn host_address(exec: Arc<E>, engine: &str) -> Self {
        Self::new(
            "engine-hostname",
            exec,
            engine,
            "hostname -I 2>/dev/null | awk '{print $1}'".into(),
            first_token,
        )
    }

    /// Resolve `host` through the engine's resolver.
    pub fn resolve(exec: Arc<E>, engine: &str, host: &str) -> Self {
        let command = format!("getent hosts {} | awk '{{print $1}}'", shell_quote(host));
        Self::new("engine-getent", exec, engine, command, first_token)
    }
}

impl<E: EngineExec + 'static> Probe for EngineCommandProbe<E> {
    fn name(&self) -> &str {
        &self.name
    }

    fn probe(&self) -> BoxFuture<'_, Option<String>> {
        Box::pin(async move {
            match self.exec.exec_ok(&self.engine, &self.command).await {
                Ok(out) => (self.parse)(&out),
                Err(e) => {
                    debug!(probe = %self.name, engine = %self.engine, error = %e, "probe command failed");
                    None
                }
            }
        })
    }
}

/// Host-side GET of a "what is my address" URL.
pub struct HttpProbe {
    client: Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

impl Probe for HttpProbe {
    fn name(&self) -> &str {
        "http-lookup"
    }

    fn probe(&self) -> BoxFuture<'_, Option<String>> {
        Box::pin(async move {
            let resp = match self.client.get(&self.url).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    debug!(url = %self.url, error = %e, "lookup request failed");
                    return None;
                }
            };
            let status = resp.status();
            if !status.is_success() {
                debug!(url = %self.url, status = status.as_u16(), "lookup returned non-success");
                return None;
            }
            let body = resp.text().await.ok()?;
            let answer = first_token(&body).and_then(|tok| first_ipv4(&tok).filter(|ip| *ip == tok));
            if answer.is_none() {
                debug!(url = %self.url, "lookup body is not an address");
            }
            answer
        })
    }
}

/// The public-host chain for one engine: configured host, host-side lookup,
/// engine-side lookup, engine address.
pub fn host_chain<E: EngineExec + 'static>(
    configured: Option<&str>,
    exec: Arc<E>,
    engine: &str,
    settings: &EndpointSettings,
) -> Vec<Box<dyn Probe>> {
    let mut probes: Vec<Box<dyn Probe>> = vec![Box::new(StaticProbe::new("configured", configured))];
    if let Some(url) = &settings.lookup_url {
        match HttpProbe::new(url, Duration::from_secs(settings.http_timeout_secs)) {
            Ok(probe) => probes.push(Box::new(probe)),
            Err(e) => warn!(error = %e, "cannot build lookup client, skipping"),
        }
        probes.push(Box::new(EngineCommandProbe::public_ip(Arc::clone(&exec), engine, url)));
    }
    probes.push(Box::new(EngineCommandProbe::host_address(exec, engine)));
    probes
}
