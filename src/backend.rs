//! Thin typed wrapper over the dashboard backend's HTTP endpoints: day stat,
//! factors, position report, option preview, order placement/cancel and pricing.

use std::time::Duration;

use anyhow::Context;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::BackendCfg;
use crate::error::{ClientError, ClientResult};
use crate::types::{Factor, Leg, OrderRequest, OrderResponse, PositionReport, PricingQuery, PricingResult, Stat};

pub struct Backend {
    client: reqwest::Client,
    base_url: String,
}

impl Backend {
    pub fn new(cfg: &BackendCfg) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_sec))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: cfg.http_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> ClientResult<T> {
        let url = self.url(path);
        debug!("GET {} {:?}", url, query);
        let response = self.client.get(&url).query(query).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                url,
                status: status.as_u16(),
            });
        }
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        payload: &impl Serialize,
    ) -> ClientResult<T> {
        let url = self.url(path);
        let response = self.client.post(&url).json(payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                url,
                status: status.as_u16(),
            });
        }
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    pub async fn stat(&self, tk: &str) -> ClientResult<Stat> {
        self.get_json("/stat", &[("tk", tk.to_string())]).await
    }

    /// Full factor list; the first two entries are capital-flow and correlation placeholders.
    pub async fn factors(&self, tk: &str) -> ClientResult<Vec<Factor>> {
        self.get_json("/factors", &[("tk", tk.to_string())]).await
    }

    pub async fn capflow(&self, tk: &str) -> ClientResult<Factor> {
        self.get_json("/capflow", &[("tk", tk.to_string())]).await
    }

    pub async fn corr(&self, tk: &str) -> ClientResult<Factor> {
        self.get_json("/corr", &[("tk", tk.to_string())]).await
    }

    pub async fn position(&self, tk: &str) -> ClientResult<PositionReport> {
        self.get_json("/position", &[("tk", tk.to_string())]).await
    }

    /// Last prices of the six strikes nearest spot for the coming weekly expiry.
    pub async fn preview(&self, tk: &str, leg: Leg) -> ClientResult<Vec<f64>> {
        let raw: Vec<Value> = self
            .get_json(
                "/preview",
                &[("tk", tk.to_string()), ("typ", leg.as_str().to_string())],
            )
            .await?;
        Ok(raw.iter().filter_map(number).collect())
    }

    pub async fn order(&self, req: &OrderRequest) -> ClientResult<OrderResponse> {
        info!(
            "POST /order {} {} {} {:?} qty={:?} money={:?}",
            req.side, req.tk, req.option, req.order_type, req.qty, req.money
        );
        let resp: OrderResponse = self.post_json("/order", req).await?;
        order_outcome(resp)
    }

    pub async fn cancel(&self, id: &str) -> ClientResult<()> {
        let _: Value = self.get_json("/cancel", &[("id", id.to_string())]).await?;
        Ok(())
    }

    pub async fn pricing(&self, q: &PricingQuery) -> ClientResult<PricingResult> {
        self.get_json("/pricing", &pricing_params(q)).await
    }
}

/// `success: false` is a rejection carrying the server's message.
pub fn order_outcome(resp: OrderResponse) -> ClientResult<OrderResponse> {
    if resp.success {
        Ok(resp)
    } else if resp.message.trim().is_empty() {
        Err(ClientError::Rejected("no reason given".to_string()))
    } else {
        Err(ClientError::Rejected(resp.message))
    }
}

fn pricing_params(q: &PricingQuery) -> Vec<(&'static str, String)> {
    vec![
        ("t", q.leg.as_str().to_string()),
        ("s", q.spot.to_string()),
        ("e", q.days.to_string()),
        ("x", q.strike.to_string()),
        ("iv", q.iv.to_string()),
        ("r", q.rate.to_string()),
    ]
}

/// JSON number or numeric string.
fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Moneyness, OrderType, QtySpec, Side};

    #[test]
    fn rejection_becomes_error_with_server_message() {
        let resp: OrderResponse =
            serde_json::from_str(r#"{"success": false, "message": "insufficient funds"}"#).unwrap();
        match order_outcome(resp) {
            Err(ClientError::Rejected(m)) => assert_eq!(m, "insufficient funds"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn submitted_order_passes_through() {
        let resp: OrderResponse = serde_json::from_str(
            r#"{"success": true, "message": "Order is submitted", "status": "new", "id": "701"}"#,
        )
        .unwrap();
        let ok = order_outcome(resp).unwrap();
        assert_eq!(ok.id.as_deref(), Some("701"));
    }

    #[test]
    fn order_body_matches_backend_schema() {
        let req = OrderRequest {
            tk: "tsla".into(),
            option: Leg::Put,
            side: Side::Buy,
            order_type: OrderType::Limit,
            qty: QtySpec::MarginMax,
            money: Moneyness::Otm,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "tk": "tsla", "option": "put", "side": "buy",
                "order_type": "LO", "qty": "mmax", "money": "otm"
            })
        );
    }

    #[test]
    fn pricing_query_uses_short_keys() {
        let q = PricingQuery {
            leg: Leg::Call,
            spot: 250.5,
            days: 4.0,
            strike: 255.0,
            iv: 0.62,
            rate: 0.045,
        };
        let p = pricing_params(&q);
        assert_eq!(p[0], ("t", "call".to_string()));
        assert_eq!(p[1], ("s", "250.5".to_string()));
        assert_eq!(p[5], ("r", "0.045".to_string()));
    }

    #[test]
    fn preview_numbers_accept_strings() {
        let raw: Vec<Value> = serde_json::from_str(r#"[1.25, "0.8", null, "x"]"#).unwrap();
        let got: Vec<f64> = raw.iter().filter_map(number).collect();
        assert_eq!(got, vec![1.25, 0.8]);
    }

    #[test]
    fn base_url_is_normalized() {
        let b = Backend::new(&BackendCfg {
            http_url: "http://localhost:8080/".into(),
            ws_url: "ws://localhost:8080".into(),
            timeout_sec: 5,
        })
        .unwrap();
        assert_eq!(b.url("/stat"), "http://localhost:8080/stat");
    }
}
