// Copyright (c) 2022-2023 The MobileCoin Foundation

use scp81_ota_tests::lifecycle;

#[tokio::test(flavor = "multi_thread")]
async fn idle_session_times_out() -> anyhow::Result<()> {
    lifecycle::idle_timeout().await
}

#[tokio::test(flavor = "multi_thread")]
async fn reset_mid_session_interrupts() -> anyhow::Result<()> {
    lifecycle::mid_session_reset().await
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_drains_sessions() -> anyhow::Result<()> {
    lifecycle::shutdown_drain().await
}
