use testbay::detect::check_docker;

/// Report Docker availability; fails when Docker is not usable.
pub async fn run_doctor_command(json: bool) -> anyhow::Result<()> {
    let detection = check_docker().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&detection)?);
    } else {
        println!("Docker: {}", detection.status);
        if let Some(version) = &detection.server_version {
            println!("  server version: {}", version);
        }
        if let Some(error) = &detection.error {
            println!("  error: {}", error);
        }
        if let Some(hint) = detection.hint() {
            println!("  hint: {}", hint);
        }
    }

    if detection.status.is_ok() {
        Ok(())
    } else {
        anyhow::bail!("Docker is {}", detection.status)
    }
}
