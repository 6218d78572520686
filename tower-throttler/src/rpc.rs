use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use shard_limit::Throttler;
use shard_limit::ThrottlerError;

/// The RPC methods the throttler registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    MaxRates,
    SetMaxRate,
}

impl Method {
    pub const ALL: [Method; 2] = [Method::MaxRates, Method::SetMaxRate];

    pub fn name(&self) -> &'static str {
        match self {
            Method::MaxRates => "MaxRates",
            Method::SetMaxRate => "SetMaxRate",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A method name that does not belong to the throttler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown throttler method: {0}")]
pub struct UnknownMethod(pub String);

impl FromStr for Method {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| UnknownMethod(s.to_owned()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaxRatesRequest {
    #[serde(default)]
    pub shard_ids: Vec<String>,
}

impl MaxRatesRequest {
    pub fn new<I, S>(shard_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            shard_ids: shard_ids.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaxRatesResponse {
    pub rates: HashMap<String, f64>,
}

/// Install (or, with `clear`, remove) a manual override for one shard.
///
/// `rate` is required unless `clear` is set; a request with neither is rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetMaxRateRequest {
    pub shard_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    #[serde(default)]
    pub clear: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}

impl SetMaxRateRequest {
    pub fn set(shard_id: impl Into<String>, rate: f64) -> Self {
        Self {
            shard_id: shard_id.into(),
            rate: Some(rate),
            ..Default::default()
        }
    }

    pub fn clear(shard_id: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            clear: true,
            ..Default::default()
        }
    }

    /// Sub-millisecond remainders round up, so a non-zero ttl never becomes zero.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        let millis = ttl.as_nanos().div_ceil(1_000_000);
        self.ttl_ms = Some(u64::try_from(millis).unwrap_or(u64::MAX));
        self
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetMaxRateResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl SetMaxRateResponse {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error_message: None,
        }
    }

    pub fn failed(err: impl fmt::Display) -> Self {
        Self {
            ok: false,
            error_message: Some(err.to_string()),
        }
    }
}

/// A request addressed to one of the throttler's [`Method`]s.
#[derive(Debug, Clone, PartialEq)]
pub enum ThrottlerRequest {
    MaxRates(MaxRatesRequest),
    SetMaxRate(SetMaxRateRequest),
}

impl ThrottlerRequest {
    pub fn method(&self) -> Method {
        match self {
            ThrottlerRequest::MaxRates(_) => Method::MaxRates,
            ThrottlerRequest::SetMaxRate(_) => Method::SetMaxRate,
        }
    }
}

impl From<MaxRatesRequest> for ThrottlerRequest {
    fn from(request: MaxRatesRequest) -> Self {
        ThrottlerRequest::MaxRates(request)
    }
}

impl From<SetMaxRateRequest> for ThrottlerRequest {
    fn from(request: SetMaxRateRequest) -> Self {
        ThrottlerRequest::SetMaxRate(request)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ThrottlerResponse {
    MaxRates(MaxRatesResponse),
    SetMaxRate(SetMaxRateResponse),
}

impl ThrottlerResponse {
    pub fn method(&self) -> Method {
        match self {
            ThrottlerResponse::MaxRates(_) => Method::MaxRates,
            ThrottlerResponse::SetMaxRate(_) => Method::SetMaxRate,
        }
    }

    pub fn into_max_rates(self) -> Option<MaxRatesResponse> {
        match self {
            ThrottlerResponse::MaxRates(response) => Some(response),
            ThrottlerResponse::SetMaxRate(_) => None,
        }
    }

    pub fn into_set_max_rate(self) -> Option<SetMaxRateResponse> {
        match self {
            ThrottlerResponse::SetMaxRate(response) => Some(response),
            ThrottlerResponse::MaxRates(_) => None,
        }
    }
}

/// The two-method interface every throttler transport dispatches to.
pub trait ThrottlerApi: Send + Sync {
    /// Current effective max rate for each requested shard.
    fn max_rates(&self, request: MaxRatesRequest) -> MaxRatesResponse;

    /// Install or clear a manual override.
    fn set_max_rate(&self, request: SetMaxRateRequest) -> SetMaxRateResponse;
}

impl ThrottlerApi for Throttler {
    fn max_rates(&self, request: MaxRatesRequest) -> MaxRatesResponse {
        MaxRatesResponse {
            rates: Throttler::max_rates(self, &request.shard_ids),
        }
    }

    fn set_max_rate(&self, request: SetMaxRateRequest) -> SetMaxRateResponse {
        let result = match (request.clear, request.rate) {
            (true, _) => self.clear_max_rate(&request.shard_id).map(|_| ()),
            (false, Some(rate)) => {
                Throttler::set_max_rate(self, &request.shard_id, rate, request.ttl())
            }
            (false, None) => Err(ThrottlerError::MissingRate {
                shard: request.shard_id.clone(),
            }),
        };

        match result {
            Ok(()) => SetMaxRateResponse::ok(),
            Err(err) => {
                tracing::debug!(shard = %request.shard_id, %err, "rejected SetMaxRate");
                SetMaxRateResponse::failed(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use shard_limit::ThrottlerConfig;

    #[test]
    fn methods_parse_by_name() {
        assert_eq!("MaxRates".parse::<Method>(), Ok(Method::MaxRates));
        assert_eq!("SetMaxRate".parse::<Method>(), Ok(Method::SetMaxRate));
        assert_eq!(
            "Shutdown".parse::<Method>(),
            Err(UnknownMethod("Shutdown".into()))
        );
        assert_eq!(Method::SetMaxRate.to_string(), "SetMaxRate");
    }

    #[test]
    fn set_max_rate_messages_have_sensible_defaults() {
        let request: SetMaxRateRequest =
            serde_json::from_str(r#"{ "shard_id": "a", "clear": true }"#).unwrap();
        assert_eq!(request, SetMaxRateRequest::clear("a"));

        let request = SetMaxRateRequest::set("a", 5.0).with_ttl(Duration::from_secs(2));
        assert_eq!(
            serde_json::to_string(&request).unwrap(),
            r#"{"shard_id":"a","rate":5.0,"clear":false,"ttl_ms":2000}"#
        );
        assert_eq!(
            serde_json::to_string(&SetMaxRateResponse::ok()).unwrap(),
            r#"{"ok":true}"#
        );
    }

    #[test]
    fn throttler_answers_both_methods() {
        let throttler = Throttler::new(ThrottlerConfig::default()).unwrap();

        let response = ThrottlerApi::set_max_rate(&throttler, SetMaxRateRequest::set("a", 12.0));
        assert_eq!(response, SetMaxRateResponse::ok());

        let response = ThrottlerApi::max_rates(&throttler, MaxRatesRequest::new(["a", "b"]));
        assert_eq!(response.rates["a"], 12.0);
        assert_eq!(response.rates["b"], ThrottlerConfig::default().default_rate);

        let response = ThrottlerApi::set_max_rate(&throttler, SetMaxRateRequest::clear("a"));
        assert!(response.ok);
        let response = ThrottlerApi::max_rates(&throttler, MaxRatesRequest::new(["a"]));
        assert_eq!(response.rates["a"], ThrottlerConfig::default().initial_rate);
    }

    #[test]
    fn negative_rates_fail_without_clear() {
        let throttler = Throttler::new(ThrottlerConfig::default()).unwrap();

        let response = ThrottlerApi::set_max_rate(&throttler, SetMaxRateRequest::set("a", -1.0));
        assert!(!response.ok);
        assert!(
            response
                .error_message
                .as_deref()
                .is_some_and(|m| m.contains("invalid max rate")),
            "{response:?}"
        );

        // The rate is ignored when clearing
        let request = SetMaxRateRequest {
            rate: Some(-1.0),
            ..SetMaxRateRequest::clear("a")
        };
        assert!(ThrottlerApi::set_max_rate(&throttler, request).ok);
    }

    #[test]
    fn a_set_without_a_rate_is_rejected() {
        let throttler = Throttler::new(ThrottlerConfig::default()).unwrap();

        let request: SetMaxRateRequest = serde_json::from_str(r#"{ "shard_id": "a" }"#).unwrap();
        assert_eq!(request.rate, None);

        let response = ThrottlerApi::set_max_rate(&throttler, request);
        assert!(!response.ok);
        assert!(
            response
                .error_message
                .as_deref()
                .is_some_and(|m| m.contains("missing max rate")),
            "{response:?}"
        );
        // Nothing was pinned
        assert!(throttler.overrides().is_empty());
        assert_eq!(
            throttler.current_rate("a"),
            ThrottlerConfig::default().default_rate
        );
    }

    #[test]
    fn ttls_round_up_to_the_next_millisecond() {
        let request = SetMaxRateRequest::set("a", 1.0).with_ttl(Duration::from_micros(1));
        assert_eq!(request.ttl_ms, Some(1));

        let request = SetMaxRateRequest::set("a", 1.0).with_ttl(Duration::from_micros(2_500));
        assert_eq!(request.ttl_ms, Some(3));

        let request = SetMaxRateRequest::set("a", 1.0).with_ttl(Duration::MAX);
        assert_eq!(request.ttl_ms, Some(u64::MAX));

        // A sub-millisecond ttl is still a valid override
        let throttler = Throttler::new(ThrottlerConfig::default()).unwrap();
        let request = SetMaxRateRequest::set("a", 1.0).with_ttl(Duration::from_nanos(10));
        assert!(ThrottlerApi::set_max_rate(&throttler, request).ok);
    }
}
