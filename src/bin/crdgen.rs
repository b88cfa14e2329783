use addon_manager::crd::Addon;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&Addon::crd())?);
    Ok(())
}
