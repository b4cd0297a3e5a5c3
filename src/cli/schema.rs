use schemars::schema_for;
use super::{SchemaArgs, SchemaTarget};
use veritas_engine::config::Config;
use veritas_engine::plan::Plan;

pub fn execute(args: SchemaArgs) -> anyhow::Result<()> {
    let schema = match args.target {
        SchemaTarget::Config => schema_for!(Config),
        SchemaTarget::Plan => schema_for!(Plan),
    };
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}
