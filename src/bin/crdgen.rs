//! CRD YAML Generator
//!
//! Prints the Kubernetes CRD manifests for all custom resources read by the
//! pgbackrest-operator.
//!
//! Usage: cargo run --bin crdgen > deploy/crds/all.yaml

use pgbackrest_operator::crd::generate_crds;

fn main() -> anyhow::Result<()> {
    for crd in generate_crds()? {
        println!("---");
        print!("{}", crd);
    }
    Ok(())
}
