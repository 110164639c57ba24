//! Prints the device plugin CRDs as a multi-document YAML stream.

use crds::GpuDevicePlugin;
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    let yaml = serde_yaml::to_string(&GpuDevicePlugin::crd())?;
    println!("---\n{yaml}");
    Ok(())
}
