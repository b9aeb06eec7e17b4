//! Sat-IP antenna adapter.
//!
//! The antenna exposes its DVB-S2 frontends over a small HTTP interface.
//! Each tick fetches the frontend-info document and maps the serving
//! frontend's fields:
//!
//! - `sq` maps to the signal level in dBm via `(10·sq − 3440) / 48`; the
//!   transform is purely linear and never clamped, so out-of-range inputs
//!   stay detectable downstream.
//! - `ber` (0–15) maps to the signal quality percentage via `ber · 100 / 15`.
//! - `ls` is `"yes"`/`"no"` for lock.
//!
//! The server occasionally expires the HTTP session and answers 200 with its
//! login page; the adapter re-authenticates once before surfacing a failure.

use std::time::Duration;

use tracing::{debug, warn};

use super::{finite, SampleError, SampleResult};
use crate::MetricRecord;

pub struct SatIpSampler {
    base_url: String,
    client: reqwest::Client,
    username: String,
    password: String,

    /// Local address talking to the server, used to pick the serving
    /// frontend when several are active.
    local_addr: Option<String>,

    /// Name of the frontend serving this client, once identified.
    serving_fe: Option<String>,
}

impl SatIpSampler {
    pub fn new(
        address: &str,
        port: u16,
        username: String,
        password: String,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            base_url: format!("http://{address}:{port}"),
            client: reqwest::Client::builder()
                .cookie_store(true)
                .connect_timeout(Duration::from_secs(3))
                .timeout(Duration::from_secs(10))
                .build()?,
            username,
            password,
            local_addr: None,
            serving_fe: None,
        })
    }

    #[cfg(test)]
    fn with_local_addr(mut self, addr: &str) -> Self {
        self.local_addr = Some(addr.to_string());
        self
    }

    pub async fn sample(&mut self) -> SampleResult {
        match self.fetch_frontend_info().await? {
            Some(info) => self.record_from_info(info),
            None => {
                // Session expired: log in again and retry once.
                warn!("Sat-IP server has closed the session; reconnecting");
                self.login().await?;
                match self.fetch_frontend_info().await? {
                    Some(info) => self.record_from_info(info),
                    None => Err(SampleError::ReceiverUnreachable(
                        "session expired and re-login did not stick".to_string(),
                    )),
                }
            }
        }
    }

    /// Fetch the frontend-info document. `Ok(None)` means the server served
    /// its login page instead, i.e. the session expired.
    async fn fetch_frontend_info(&self) -> Result<Option<serde_json::Value>, SampleError> {
        let url = format!("{}/cgi-bin/index.cgi", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("cmd", "frontend_info")])
            .send()
            .await
            .map_err(|e| SampleError::ReceiverUnreachable(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SampleError::ReceiverUnreachable(e.to_string()))?;

        match serde_json::from_str::<serde_json::Value>(&body) {
            Ok(info) => Ok(Some(info)),
            Err(_) if status.as_u16() == 200 && body.contains("/cgi-bin/login.cgi") => Ok(None),
            Err(e) => Err(SampleError::ReceiverMalformed(format!(
                "frontend info: {e}"
            ))),
        }
    }

    async fn login(&self) -> Result<(), SampleError> {
        let url = format!("{}/cgi-bin/login.cgi", self.base_url);
        let response = self
            .client
            .post(&url)
            .form(&[
                ("cmd", "login"),
                ("username", &self.username),
                ("password", &self.password),
            ])
            .send()
            .await
            .map_err(|e| SampleError::ReceiverUnreachable(format!("login: {e}")))?;

        if !response.status().is_success() {
            return Err(SampleError::ReceiverUnreachable(format!(
                "login failed with HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    fn record_from_info(&mut self, info: serde_json::Value) -> SampleResult {
        let frontends = info
            .get("frontends")
            .and_then(|f| f.as_array())
            .ok_or_else(|| {
                SampleError::ReceiverMalformed("no frontends in info document".to_string())
            })?;

        let active: Vec<&serde_json::Value> = frontends
            .iter()
            .filter_map(|fe| fe.get("frontend"))
            .filter(|fe| {
                let ip = fe.get("ip").and_then(|v| v.as_str()).unwrap_or("none");
                ip != "none" && ip != "NA"
            })
            .collect();

        if active.is_empty() {
            warn!("could not find any active frontend");
            return Ok(MetricRecord::unlocked());
        }

        let serving = self.select_serving(&active);
        parse_frontend(serving)
    }

    /// Pick the frontend serving this client: the previously chosen one if
    /// still active, else the one streaming to the local address, else the
    /// most recent active entry.
    fn select_serving<'a>(
        &mut self,
        active: &[&'a serde_json::Value],
    ) -> &'a serde_json::Value {
        let name_of =
            |fe: &serde_json::Value| fe.get("name").and_then(|v| v.as_str()).map(String::from);

        if let Some(current) = self.serving_fe.clone() {
            if let Some(fe) = active
                .iter()
                .find(|fe| name_of(fe).as_deref() == Some(current.as_str()))
            {
                return *fe;
            }
            warn!("Sat-IP frontend {current} has become inactive");
            self.serving_fe = None;
        }

        let chosen = self
            .local_addr
            .as_ref()
            .and_then(|addr| {
                active
                    .iter()
                    .find(|fe| fe.get("ip").and_then(|v| v.as_str()) == Some(addr))
            })
            .or(active.last())
            .copied()
            .unwrap_or(active[0]);

        self.serving_fe = name_of(chosen);
        debug!("serving frontend: {:?}", self.serving_fe);
        chosen
    }
}

/// Map one frontend entry into a record.
fn parse_frontend(fe: &serde_json::Value) -> SampleResult {
    let lock = fe.get("ls").and_then(|v| v.as_str()) == Some("yes");
    if !lock {
        return Ok(MetricRecord::unlocked());
    }

    let sq = num_field(fe, "sq")?;
    let ber = num_field(fe, "ber")?;

    Ok(MetricRecord {
        level: finite((10.0 * sq - 3440.0) / 48.0),
        quality: finite(ber * 100.0 / 15.0),
        ..MetricRecord::locked()
    })
}

/// Frontend fields arrive as numbers or numeric strings depending on the
/// firmware version.
fn num_field(fe: &serde_json::Value, key: &str) -> Result<f64, SampleError> {
    let value = fe
        .get(key)
        .ok_or_else(|| SampleError::ReceiverMalformed(format!("missing {key}")))?;

    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| SampleError::ReceiverMalformed(format!("bad {key}: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn frontend_json(name: &str, ip: &str, ls: &str, sq: f64, ber: f64) -> serde_json::Value {
        serde_json::json!({
            "frontend": {
                "name": name,
                "ip": ip,
                "fq": "12016.4",
                "pol": "h",
                "sq": sq,
                "ber": ber,
                "ls": ls,
            }
        })
    }

    async fn sampler_for(server: &MockServer) -> SatIpSampler {
        let uri = url::Url::parse(&server.uri()).unwrap();
        SatIpSampler::new(
            uri.host_str().unwrap(),
            uri.port().unwrap(),
            "admin".to_string(),
            "admin".to_string(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_maps_frontend_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cgi-bin/index.cgi"))
            .and(query_param("cmd", "frontend_info"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "frontends": [frontend_json("fe1", "10.0.0.2", "yes", 6100.0, 12.0)]
            })))
            .mount(&server)
            .await;

        let mut sampler = sampler_for(&server).await;
        let record = sampler.sample().await.unwrap();

        assert!(record.lock);
        // (10 * 6100 - 3440) / 48
        assert!((record.level.unwrap() - 1199.1666).abs() < 1e-3);
        assert!((record.quality.unwrap() - 80.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_sq_zero_maps_to_floor_level() {
        let fe = frontend_json("fe1", "10.0.0.2", "yes", 0.0, 0.0);
        let record = parse_frontend(fe.get("frontend").unwrap()).unwrap();
        assert!((record.level.unwrap() - (-71.6666)).abs() < 1e-3);
        // The transform is linear and unclamped by design.
    }

    #[tokio::test]
    async fn test_unlocked_frontend() {
        let fe = frontend_json("fe1", "10.0.0.2", "no", 6100.0, 12.0);
        let record = parse_frontend(fe.get("frontend").unwrap()).unwrap();
        assert_eq!(record, MetricRecord::unlocked());
    }

    #[tokio::test]
    async fn test_session_expiry_triggers_single_relogin() {
        let server = MockServer::start().await;

        // First answer: the login page, with HTTP 200.
        Mock::given(method("GET"))
            .and(path("/cgi-bin/index.cgi"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<form action=\"/cgi-bin/login.cgi\">"),
            )
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/cgi-bin/login.cgi"))
            .and(body_string_contains("cmd=login"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/cgi-bin/index.cgi"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "frontends": [frontend_json("fe1", "10.0.0.2", "yes", 6100.0, 15.0)]
            })))
            .mount(&server)
            .await;

        let mut sampler = sampler_for(&server).await;
        let record = sampler.sample().await.unwrap();
        assert!(record.lock);
        assert!((record.quality.unwrap() - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_prefers_frontend_serving_local_address() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cgi-bin/index.cgi"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "frontends": [
                    frontend_json("fe1", "10.0.0.8", "yes", 100.0, 1.0),
                    frontend_json("fe2", "10.0.0.2", "yes", 6100.0, 12.0),
                    frontend_json("fe3", "none", "no", 0.0, 0.0),
                ]
            })))
            .mount(&server)
            .await;

        let mut sampler = sampler_for(&server).await.with_local_addr("10.0.0.2");
        let record = sampler.sample().await.unwrap();

        assert!((record.quality.unwrap() - 80.0).abs() < 1e-9);
        assert_eq!(sampler.serving_fe.as_deref(), Some("fe2"));
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let mut sampler =
            SatIpSampler::new("127.0.0.1", 1, "admin".to_string(), "admin".to_string())
                .unwrap();
        match sampler.sample().await {
            Err(SampleError::ReceiverUnreachable(_)) => {}
            other => panic!("expected ReceiverUnreachable, got {other:?}"),
        }
    }
}
