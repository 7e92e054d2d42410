use clap::{Parser, Subcommand};

/// costgov: cost-governance escalation engine
#[derive(Parser)]
#[command(name = "costgov", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the API server and the timeout sweeper
    Serve {
        /// Port to bind (defaults to COSTGOV_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run one timeout sweep and exit
    Sweep {
        /// Max workflows to expire (defaults to COSTGOV_SWEEP_BATCH_SIZE)
        #[arg(long)]
        batch_size: Option<i64>,
    },

    /// Inspect and decide approval workflows
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },

    /// Payroll deduction feed
    Deduction {
        #[command(subcommand)]
        command: DeductionCommands,
    },

    /// Threshold policies
    Policy {
        #[command(subcommand)]
        command: PolicyCommands,
    },
}

#[derive(Subcommand)]
pub enum WorkflowCommands {
    /// List pending workflows
    List {
        /// Only workflows that need this role (fc, gm, ceo)
        #[arg(short, long)]
        role: Option<String>,
    },
    /// Record an approver's decision
    Decide {
        workflow_id: String,
        #[arg(long)]
        approver: String,
        /// approve or reject
        #[arg(long)]
        decision: String,
        #[arg(long)]
        comment: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum DeductionCommands {
    /// List deductions
    List {
        /// pending, processed, cancelled or failed
        #[arg(short, long)]
        status: Option<String>,
    },
    /// Mark a deduction as applied by payroll
    Processed {
        deduction_id: String,
        #[arg(long, default_value = "cli")]
        actor: String,
    },
}

#[derive(Subcommand)]
pub enum PolicyCommands {
    /// List the active policy book
    List,
}
