// Inventory fetched over HTTP

use std::time::Duration;

use tracing::debug;

use super::static_inv::parse_inventory;
use crate::output::errors::SpotError;
use crate::parser::ast::Destination;

/// Client timeout for inventory downloads
pub const INVENTORY_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// GET an inventory from `url` and parse it. Any non-2xx status is an error.
pub async fn fetch_inventory(
    url: &str,
    groups: &[String],
    default_user: &str,
) -> Result<Vec<Destination>, SpotError> {
    let fetch_err = |message: String| SpotError::Inventory {
        location: url.to_string(),
        message,
    };

    let client = reqwest::Client::builder()
        .timeout(INVENTORY_HTTP_TIMEOUT)
        .build()
        .map_err(|e| fetch_err(format!("can't build http client: {}", e)))?;

    debug!("fetch inventory from {}", url);
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| fetch_err(format!("can't get inventory from http: {}", e)))?;

    if !resp.status().is_success() {
        return Err(SpotError::InventoryStatus {
            url: url.to_string(),
            status: resp.status().to_string(),
        });
    }

    let body = resp
        .text()
        .await
        .map_err(|e| fetch_err(format!("inventory reader failed: {}", e)))?;

    parse_inventory(&body, groups, default_user)
        .map_err(|e| fetch_err(format!("can't parse inventory from http: {}", e)))
}
