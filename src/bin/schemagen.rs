use eksforge::config::ConfigFile;

fn main() -> anyhow::Result<()> {
    let schema = schemars::schema_for!(ConfigFile);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}
