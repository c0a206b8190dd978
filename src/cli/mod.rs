use clap::Parser;

#[derive(Parser)]
#[command(author, version, about = "Automated approver for node CSRs", long_about = None)]
pub struct Args {
    /// Approver configuration file (YAML). Missing file means defaults.
    #[arg(long = "config-file", value_name = "PATH")]
    pub config_file: Option<String>,

    /// Kubeconfig for the workload plane (CSRs, nodes, kubelet CA).
    /// Defaults to in-cluster configuration.
    #[arg(long, value_name = "PATH")]
    pub kubeconfig: Option<String>,

    /// Kubeconfig for the control plane (machines, network). Defaults to
    /// the workload-plane connection.
    #[arg(long = "machine-kubeconfig", value_name = "PATH")]
    pub machine_kubeconfig: Option<String>,

    /// Machine API group to consult, as GROUP or GROUP/VERSION. May be
    /// repeated; defaults to machine.openshift.io and cluster.k8s.io.
    #[arg(long = "apigroup", value_name = "GROUP")]
    pub api_groups: Vec<String>,
}
