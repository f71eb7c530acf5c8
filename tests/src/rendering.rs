// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Template rendering driven end to end: render, serve, execute

use std::collections::BTreeMap;
use std::time::Duration;

use scp81_ota_core::script::{self, ApduCommand, ParameterDef, RenderError, Template};
use scp81_ota_core::session::CloseReason;
use scp81_ota_sim::{always_ok, CardClient, CardOptions};

use crate::helpers::{self, TEST_IDENTITY, TEST_KEY_HEX};

fn select_template() -> Template {
    let mut parameters = BTreeMap::new();
    parameters.insert("AID".to_string(), ParameterDef::hex(5, 16));
    parameters.insert("AID_LEN".to_string(), ParameterDef::hex(1, 1));

    Template::new(
        "apdu-select",
        "Select by AID",
        vec![ApduCommand::new("00A40400${AID_LEN}${AID}")],
        parameters,
    )
}

/// Render the select template and run the result against a live server
pub async fn rendered_script_session() -> anyhow::Result<()> {
    let bindings = BTreeMap::from([
        ("AID".to_string(), "A0000000041010".to_string()),
        ("AID_LEN".to_string(), "07".to_string()),
    ]);

    let rendered = script::render(&select_template(), &bindings)?;
    assert_eq!(rendered.commands.len(), 1);
    assert_eq!(rendered.commands[0].hex, "00A4040007A0000000041010");

    let server = helpers::start_server(rendered, |_| {}).await?;

    let options = CardOptions::new(TEST_IDENTITY, hex::decode(TEST_KEY_HEX)?);
    let mut card = CardClient::connect(&server.addr, options).await?;
    let stats = card.run_dialog(always_ok).await?;
    assert_eq!(stats.commands, 1);

    let session = server
        .wait_for_closed_session(Duration::from_secs(2))
        .await;
    assert_eq!(session.close_reason, Some(CloseReason::Normal));
    assert_eq!(session.exchanges[0].command_hex, "00A4040007A0000000041010");

    server.stop().await;
    Ok(())
}

/// A missing required parameter fails the render before any session
/// can start
pub fn missing_parameter() {
    let bindings = BTreeMap::from([("AID_LEN".to_string(), "07".to_string())]);

    let result = script::render(&select_template(), &bindings);
    assert_eq!(
        result,
        Err(RenderError::MissingParameter("AID".to_string()))
    );
}
