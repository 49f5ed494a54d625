use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = seplos_mqtt::cli::parse_args();
    let config = seplos_mqtt::cli::config_from_matches(&matches)?;
    seplos_mqtt::boot::init_logger(config.log_level);

    if let Err(err) = seplos_mqtt::boot::start(config).await {
        log::error!("{err:#}");
        return Err(err);
    }
    Ok(())
}
