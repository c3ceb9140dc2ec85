use kube::CustomResourceExt;
use united::crd::UnitedDeployment;

fn main() -> anyhow::Result<()> {
    // Pipe through `yq -P` (or similar) for a YAML manifest
    let crd = serde_json::to_string_pretty(&UnitedDeployment::crd())?;
    println!("{}", crd);
    Ok(())
}
