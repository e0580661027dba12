//! Prints the CRD manifests to stdout, for `kubectl apply -f -`.

use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&canopy::apis::NodePool::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&canopy::apis::NodeClaim::crd())?);
    Ok(())
}
