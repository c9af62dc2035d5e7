//! One-shot activation flow.
//!
//! Fetches the license records bound to this machine's hardware identity,
//! matches the entered key, verifies expiry, and binds an empty device slot
//! (two per key) before persisting the encrypted activation record.

use super::hwid;
use super::LicenseFetchResponse;
use anyhow::{anyhow, bail, Result};
use chrono::{Local, NaiveDateTime};
use vwar_core::activation::{ActivationStore, EXPIRY_FORMAT};
use vwar_core::config::EngineConfig;
use vwar_core::paths::Layout;

pub async fn activate(
    layout: &Layout,
    config: &EngineConfig,
    license_key: &str,
    auto_renew: bool,
) -> Result<()> {
    if license_key.is_empty() {
        bail!("license key must not be empty");
    }
    let hw = hwid::detect();
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()?;

    let response = client
        .post(&config.endpoints.license_fetch_url)
        .header("X-API-Key", &config.endpoints.license_fetch_key)
        .json(&serde_json::json!({
            "processor_id": hw.processor_id,
            "motherboard_id": hw.motherboard_id,
        }))
        .send()
        .await
        .map_err(|e| anyhow!("activation server unreachable: {e}"))?;
    if !response.status().is_success() {
        bail!("activation server returned status {}", response.status());
    }
    let body: LicenseFetchResponse = response.json().await?;

    let mut found = body
        .data
        .into_iter()
        .find(|r| r.password == license_key)
        .ok_or_else(|| anyhow!("the license key entered is not valid"))?;

    let expiry = NaiveDateTime::parse_from_str(&found.valid_till, EXPIRY_FORMAT)
        .map_err(|e| anyhow!("failed to validate license expiry: {e}"))?;
    if Local::now().naive_local() > expiry {
        bail!("this license key has expired; please renew your license");
    }

    let store = ActivationStore::new(layout);

    // Already bound to this machine: refresh the local record and finish.
    if let Some(slot) = found.hardware_slot(&hw.processor_id, &hw.motherboard_id) {
        store.store(&found)?;
        println!("Already activated on this system (device slot {slot} of 2).");
        return Ok(());
    }

    // Bind the first empty slot.
    let slot = if found.processor_id.is_none() || found.motherboard_id.is_none() {
        1
    } else if found.processor_id_2.is_none() || found.motherboard_id_2.is_none() {
        2
    } else {
        bail!(
            "this license key is already activated on 2 devices; \
             deactivate one of the existing devices first"
        );
    };

    let bind_payload = if slot == 1 {
        serde_json::json!({
            "id": found.id,
            "slot": slot,
            "processor_id": hw.processor_id,
            "motherboard_id": hw.motherboard_id,
        })
    } else {
        serde_json::json!({
            "id": found.id,
            "slot": slot,
            "processor_id_2": hw.processor_id,
            "motherboard_id_2": hw.motherboard_id,
        })
    };
    let bind_response = client
        .post(&config.endpoints.hw_info_insert_url)
        .header("X-API-Key", &config.endpoints.hw_info_insert_key)
        .json(&bind_payload)
        .send()
        .await
        .map_err(|e| anyhow!("failed to bind activation: {e}"))?;
    let result: serde_json::Value = bind_response.json().await.unwrap_or_default();
    if result.get("status").and_then(|s| s.as_str()) != Some("success") {
        let message = result
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("server rejected activation attempt");
        bail!("activation failed: {message}");
    }

    if slot == 1 {
        found.processor_id = Some(hw.processor_id.clone());
        found.motherboard_id = Some(hw.motherboard_id.clone());
    } else {
        found.processor_id_2 = Some(hw.processor_id.clone());
        found.motherboard_id_2 = Some(hw.motherboard_id.clone());
    }
    if auto_renew {
        found.auto_renew = Some("YES".into());
    }
    store.store(&found)?;

    if auto_renew {
        match super::set_auto_renew_for(&client, &config.endpoints, found.id, true).await {
            Ok(true) => {}
            Ok(false) => eprintln!("warning: server refused auto-renew update"),
            Err(e) => eprintln!("warning: failed to sync auto-renew: {e}"),
        }
    }

    println!(
        "Activated successfully.\nDevice slot: {slot} of 2\nValid until: {}\nAuto-renew: {}",
        found.valid_till,
        if auto_renew { "enabled" } else { "disabled" }
    );
    Ok(())
}
