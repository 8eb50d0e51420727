use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::{Config, KEEPA_DOMAIN_US, MAX_GROUP_SIZE};
use crate::error::{AppError, Result};
use crate::types::{FetchUsage, ProductSnapshot};

/// Seam between the orchestrator and the upstream product-data API.
/// Implemented by `KeepaClient` in production and by in-memory mocks in
/// orchestrator tests.
#[async_trait]
pub trait ProductSource: Send + Sync {
    /// Fetch one group of at most `MAX_GROUP_SIZE` ASINs in a single call.
    /// Returns the snapshots that parsed (missing/null products are simply
    /// absent) plus the token usage the upstream reported for the call.
    async fn fetch_group(&self, asins: &[String]) -> Result<(Vec<ProductSnapshot>, FetchUsage)>;
}

/// Batched client for the Keepa /product endpoint.
pub struct KeepaClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl KeepaClient {
    pub fn new(cfg: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.api_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: cfg.keepa_api_url.clone(),
            api_key: cfg.keepa_api_key.clone(),
        })
    }
}

#[async_trait]
impl ProductSource for KeepaClient {
    async fn fetch_group(&self, asins: &[String]) -> Result<(Vec<ProductSnapshot>, FetchUsage)> {
        if asins.len() > MAX_GROUP_SIZE {
            return Err(AppError::FetchData(format!(
                "group of {} exceeds the {MAX_GROUP_SIZE}-ASIN call limit",
                asins.len()
            )));
        }

        let url = format!(
            "{}/product?key={}&domain={}&asin={}&stats=7&history=0",
            self.base_url,
            self.api_key,
            KEEPA_DOMAIN_US,
            asins.join(","),
        );

        let started = Instant::now();
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AppError::FetchTransport(e.to_string()))?;

        // Credential rejections will not self-heal within a run; surface them
        // as config failures rather than entering the retry path.
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AppError::Config(format!(
                "product API rejected credentials (HTTP {status})"
            )));
        }
        if !status.is_success() {
            return Err(AppError::FetchTransport(format!(
                "product API returned HTTP {status}"
            )));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AppError::FetchData(format!("unreadable response body: {e}")))?;
        let response_time_ms = started.elapsed().as_millis() as i64;

        let fetched_at = now_secs();
        let mut snapshots = Vec::new();
        if let Some(products) = body.get("products").and_then(|p| p.as_array()) {
            for product in products {
                if product.is_null() {
                    continue;
                }
                match parse_product(product, fetched_at) {
                    Some(snapshot) => snapshots.push(snapshot),
                    None => warn!("product entry without an ASIN, skipping"),
                }
            }
        }

        let usage = FetchUsage {
            asins_requested: asins.len(),
            tokens_consumed: body
                .get("tokensConsumed")
                .and_then(|t| t.as_i64())
                .unwrap_or(asins.len() as i64),
            tokens_left: body.get("tokensLeft").and_then(|t| t.as_i64()),
            response_time_ms,
        };

        info!(
            asins_requested = asins.len(),
            products_returned = snapshots.len(),
            tokens_consumed = usage.tokens_consumed,
            tokens_left = usage.tokens_left,
            response_time_ms,
            "Keepa batch request completed",
        );

        Ok((snapshots, usage))
    }
}

/// Parse one product object into a strict snapshot at the ingestion
/// boundary, isolating the rest of the pipeline from upstream schema drift.
/// Returns None only when the entry has no ASIN at all.
///
/// Rank arrays are Keepa history series; index 1 holds the current rank.
/// A payload without a usable salesRanks object is kept (for audit) but
/// flagged incomplete so diffing treats it as a data gap.
pub fn parse_product(v: &serde_json::Value, fetched_at: i64) -> Option<ProductSnapshot> {
    let asin = v.get("asin")?.as_str()?.to_string();

    let title = v
        .get("title")
        .and_then(|t| t.as_str())
        .map(|s| s.to_string());

    let mut category_names: BTreeMap<String, String> = BTreeMap::new();
    if let Some(tree) = v.get("categoryTree").and_then(|t| t.as_array()) {
        for node in tree {
            let (Some(cat_id), Some(name)) = (
                node.get("catId").and_then(category_id_str),
                node.get("name").and_then(|n| n.as_str()),
            ) else {
                continue;
            };
            category_names.insert(cat_id, name.to_string());
        }
    }

    let ranks_obj = v.get("salesRanks").and_then(|r| r.as_object());
    let complete = ranks_obj.is_some();

    let mut sales_ranks: BTreeMap<String, i64> = BTreeMap::new();
    if let Some(obj) = ranks_obj {
        for (category_id, series) in obj {
            let Some(rank) = series
                .as_array()
                .filter(|a| a.len() >= 2)
                .and_then(|a| a[1].as_i64())
            else {
                debug!(asin = %asin, category_id = %category_id, "unusable rank series, skipping category");
                continue;
            };
            // Negative ranks are Keepa's "no data" marker.
            if rank > 0 {
                sales_ranks.insert(category_id.clone(), rank);
            }
        }
    }

    let monthly_sold = v.get("monthlySold").and_then(|m| m.as_i64());

    Some(ProductSnapshot {
        asin,
        title,
        fetched_at,
        sales_ranks,
        category_names,
        monthly_sold,
        complete,
        raw_payload: v.clone(),
    })
}

/// Category ids appear both as numbers and strings across payload versions.
fn category_id_str(v: &serde_json::Value) -> Option<String> {
    if let Some(n) = v.as_i64() {
        return Some(n.to_string());
    }
    v.as_str().map(|s| s.to_string())
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_ranks_names_and_monthly_sold() {
        let payload = json!({
            "asin": "B0088PUEPK",
            "title": "WD 2TB Elements",
            "monthlySold": 3000,
            "categoryTree": [
                {"catId": 172282, "name": "Electronics"},
                {"catId": 595048, "name": "External Hard Drives"}
            ],
            "salesRanks": {
                "172282": [7609388, 42],
                "595048": [7609388, 1]
            }
        });

        let snap = parse_product(&payload, 1_700_000_000).unwrap();
        assert_eq!(snap.asin, "B0088PUEPK");
        assert_eq!(snap.title.as_deref(), Some("WD 2TB Elements"));
        assert_eq!(snap.sales_ranks["172282"], 42);
        assert_eq!(snap.sales_ranks["595048"], 1);
        assert_eq!(snap.category_names["595048"], "External Hard Drives");
        assert_eq!(snap.monthly_sold, Some(3000));
        assert!(snap.complete);
    }

    #[test]
    fn missing_sales_ranks_flags_incomplete() {
        let payload = json!({"asin": "B000000001", "title": "No ranks"});
        let snap = parse_product(&payload, 0).unwrap();
        assert!(snap.sales_ranks.is_empty());
        assert!(!snap.complete);
    }

    #[test]
    fn malformed_rank_series_is_skipped_not_fatal() {
        let payload = json!({
            "asin": "B000000002",
            "salesRanks": {
                "100": "not-an-array",
                "200": [7609388],
                "300": [7609388, 5]
            }
        });
        let snap = parse_product(&payload, 0).unwrap();
        assert_eq!(snap.sales_ranks.len(), 1);
        assert_eq!(snap.sales_ranks["300"], 5);
        assert!(snap.complete);
    }

    #[test]
    fn negative_rank_means_no_data() {
        let payload = json!({
            "asin": "B000000003",
            "salesRanks": {"100": [7609388, -1]}
        });
        let snap = parse_product(&payload, 0).unwrap();
        assert!(snap.sales_ranks.is_empty());
    }

    #[test]
    fn entry_without_asin_is_rejected() {
        assert!(parse_product(&json!({"title": "nameless"}), 0).is_none());
    }

    #[test]
    fn string_category_ids_resolve() {
        let payload = json!({
            "asin": "B000000004",
            "categoryTree": [{"catId": "9000", "name": "Books"}],
            "salesRanks": {"9000": [0, 1]}
        });
        let snap = parse_product(&payload, 0).unwrap();
        assert_eq!(snap.category_names["9000"], "Books");
    }
}
