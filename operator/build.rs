use hibernator_types::*;
use kube::CustomResourceExt;
use std::fs;

fn main() {
    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/hibernator.io_plan_crd.yaml",
        serde_yaml::to_string(&Plan::crd()).unwrap(),
    )
    .unwrap();
    fs::write(
        "../crds/hibernator.io_exception_crd.yaml",
        serde_yaml::to_string(&Exception::crd()).unwrap(),
    )
    .unwrap();
}
