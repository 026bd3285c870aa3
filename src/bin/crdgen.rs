use kube::CustomResourceExt;
use nodehealth_k8s::crd::NodeHealthCheck;

fn main() {
    print!("{}", serde_yaml::to_string(&NodeHealthCheck::crd()).unwrap());
}
