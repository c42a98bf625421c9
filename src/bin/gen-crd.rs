use kube::CustomResourceExt;
use sop_operator::crd::sop::Sop;

fn main() -> anyhow::Result<()> {
    // Pipe through a JSON-to-YAML converter to produce deploy/crd.yaml
    let json_output = serde_json::to_string_pretty(&Sop::crd())?;
    println!("{}", json_output);
    Ok(())
}
