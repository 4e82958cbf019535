//! Client for the gateway's local HTTPS API.
//!
//! The gateway serves a self-signed certificate and a cookie-authenticated
//! JSON API. Authentication is lazy: the first call that comes back with
//! 401/403 triggers a login and is retried with the fresh token.

mod error;
pub mod models;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{StatusCode, Url, header};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::{sync::RwLock, time::sleep};

pub use self::error::Error;
use self::models::{
    MeterAggregates,
    MeterDevice,
    Network,
    Operation,
    Problems,
    Sitemaster,
    StateOfEnergy,
    Status,
    SystemStatus,
};
use crate::prelude::*;

/// Fetch operations the collector needs from the gateway.
///
/// The real [`Client`] talks to the appliance; tests substitute a scripted
/// fake without touching the collection logic.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn get_status(&self) -> Result<Status, Error>;

    async fn get_state_of_energy(&self) -> Result<StateOfEnergy, Error>;

    async fn get_operation(&self) -> Result<Operation, Error>;

    async fn get_sitemaster(&self) -> Result<Sitemaster, Error>;

    async fn get_problems(&self) -> Result<Problems, Error>;

    async fn get_system_status(&self) -> Result<SystemStatus, Error>;

    async fn get_meter_aggregates(&self) -> Result<MeterAggregates, Error>;

    async fn get_meters(&self, category: &str) -> Result<Vec<MeterDevice>, Error>;

    async fn get_networks(&self) -> Result<Vec<Network>, Error>;
}

pub struct Client {
    inner: reqwest::Client,
    base_url: Url,
    login_email: String,
    login_password: String,
    retry_interval: Duration,
    retry_timeout: Duration,
    token: RwLock<Option<String>>,
}

impl Client {
    /// Build a client for the given gateway address.
    ///
    /// With a pinned certificate the connection is verified against it alone;
    /// without one, verification is disabled since the gateway's certificate
    /// is self-signed.
    pub fn try_new(
        gateway_address: &str,
        login_email: &str,
        login_password: &str,
        certificate: Option<reqwest::Certificate>,
    ) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("powerwall-exporter/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10));
        builder = match certificate {
            Some(certificate) => {
                builder.tls_built_in_root_certs(false).add_root_certificate(certificate)
            }
            None => builder.danger_accept_invalid_certs(true),
        };
        let base_url = Url::parse(&format!("https://{gateway_address}/"))
            .with_context(|| format!("invalid gateway address `{gateway_address}`"))?;
        Ok(Self {
            inner: builder.build().context("failed to build the HTTP client")?,
            base_url,
            login_email: login_email.to_string(),
            login_password: login_password.to_string(),
            retry_interval: Duration::from_secs(1),
            retry_timeout: Duration::ZERO,
            token: RwLock::new(None),
        })
    }

    /// Have transport failures retried until the timeout budget runs out.
    /// A zero timeout disables retries.
    pub const fn set_retry_policy(&mut self, interval: Duration, timeout: Duration) {
        self.retry_interval = interval;
        self.retry_timeout = timeout;
    }

    #[instrument(skip_all, level = Level::DEBUG, fields(path = path))]
    async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R, Error> {
        let started = Instant::now();
        loop {
            match self.get_once(path).await {
                Err(error)
                    if error.is_transport() && started.elapsed() < self.retry_timeout =>
                {
                    warn!(path, "retrying: {error}");
                    sleep(self.retry_interval).await;
                }
                result => return result,
            }
        }
    }

    async fn get_once<R: DeserializeOwned>(&self, path: &str) -> Result<R, Error> {
        let response = self.request(path).await?;
        if matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            debug!(path, "unauthorized, logging in…");
            self.login().await?;
            let response = self.request(path).await?;
            return Self::read_json(response).await;
        }
        Self::read_json(response).await
    }

    async fn request(&self, path: &str) -> Result<reqwest::Response, Error> {
        let url = self
            .base_url
            .join(path)
            .map_err(|error| Error::Application(error.into()))?;
        let mut request = self.inner.get(url);
        if let Some(token) = self.token.read().await.as_ref() {
            request = request.header(header::COOKIE, format!("AuthCookie={token}"));
        }
        request.send().await.map_err(Error::from)
    }

    async fn read_json<R: DeserializeOwned>(response: reqwest::Response) -> Result<R, Error> {
        response
            .error_for_status()
            .map_err(Error::from)?
            .json()
            .await
            .map_err(Error::from)
    }

    #[instrument(skip_all)]
    async fn login(&self) -> Result<(), Error> {
        #[derive(Serialize)]
        struct LoginRequest<'a> {
            username: &'a str,
            email: &'a str,
            password: &'a str,
            force_sm_off: bool,
        }

        #[derive(Deserialize)]
        struct LoginResponse {
            token: String,
        }

        let url = self
            .base_url
            .join("api/login/Basic")
            .map_err(|error| Error::Application(error.into()))?;
        let response: LoginResponse = self
            .inner
            .post(url)
            .json(&LoginRequest {
                username: "customer",
                email: &self.login_email,
                password: &self.login_password,
                force_sm_off: false,
            })
            .send()
            .await
            .map_err(Error::from)?
            .error_for_status()
            .map_err(Error::from)?
            .json()
            .await
            .map_err(Error::from)?;
        *self.token.write().await = Some(response.token);
        info!("logged in to the gateway");
        Ok(())
    }
}

#[async_trait]
impl Gateway for Client {
    async fn get_status(&self) -> Result<Status, Error> {
        self.get("api/status").await
    }

    async fn get_state_of_energy(&self) -> Result<StateOfEnergy, Error> {
        self.get("api/system_status/soe").await
    }

    async fn get_operation(&self) -> Result<Operation, Error> {
        self.get("api/operation").await
    }

    async fn get_sitemaster(&self) -> Result<Sitemaster, Error> {
        self.get("api/sitemaster").await
    }

    async fn get_problems(&self) -> Result<Problems, Error> {
        self.get("api/troubleshooting/problems").await
    }

    async fn get_system_status(&self) -> Result<SystemStatus, Error> {
        self.get("api/system_status").await
    }

    async fn get_meter_aggregates(&self) -> Result<MeterAggregates, Error> {
        self.get("api/meters/aggregates").await
    }

    async fn get_meters(&self, category: &str) -> Result<Vec<MeterDevice>, Error> {
        self.get(&format!("api/meters/{category}")).await
    }

    async fn get_networks(&self) -> Result<Vec<Network>, Error> {
        self.get("api/networks").await
    }
}
