//! Reference bundle tool.
//!
//! `export` seeds a network and writes `test_weights.json` plus `test_case.json`;
//! `verify` loads a bundle into the generic graph executor and checks it.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tcg_policy_wasm::verify::{export_reference_bundle, verify_bundle};
use tcg_policy_wasm::{NetworkConfig, VerifyConfig};

#[derive(Parser, Debug)]
#[command(name = "tcg-policy")]
#[command(about = "Export and verify policy/value reference bundles")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a seeded archive and its test vector
    Export {
        /// Output directory
        #[arg(long, default_value = "models")]
        out_dir: PathBuf,

        /// Optional JSON file with NetworkConfig overrides
        #[arg(long)]
        network: Option<PathBuf>,

        #[arg(long, default_value_t = 42)]
        init_seed: u64,

        #[arg(long, default_value_t = 123)]
        input_seed: u64,

        #[arg(long, default_value_t = 5)]
        num_actions: usize,
    },
    /// Replay a bundle through the graph executor
    Verify {
        /// Directory holding test_weights.json and test_case.json
        #[arg(long, default_value = "models")]
        dir: PathBuf,

        /// Absolute tolerance for scores, value and policy
        #[arg(long, default_value_t = 1e-5)]
        tolerance: f32,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Command::Export {
            out_dir,
            network,
            init_seed,
            input_seed,
            num_actions,
        } => {
            let network = match network {
                Some(path) => {
                    let text = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    serde_json::from_str::<NetworkConfig>(&text)
                        .with_context(|| format!("parsing {}", path.display()))?
                }
                None => NetworkConfig::default(),
            };
            let config = VerifyConfig {
                init_seed,
                input_seed,
                num_actions,
                ..VerifyConfig::default()
            };
            let bundle = export_reference_bundle(&out_dir, network, &config)?;
            let tv = &bundle.test_vector;
            println!("State size:  {}", tv.state.len());
            println!("Num actions: {}", tv.actions.len());
            println!("Scores: {:?}", tv.expected_scores);
            println!("Value:  {:.6}", tv.expected_value);
            println!("Policy: {:?}", tv.expected_policy);
        }
        Command::Verify { dir, tolerance } => {
            let config = VerifyConfig {
                score_tolerance: tolerance,
                value_tolerance: tolerance,
                policy_tolerance: tolerance,
                ..VerifyConfig::default()
            };
            let report = verify_bundle(&dir, &config)?;
            println!("max score error:  {:.3e}", report.max_score_error);
            println!("value error:      {:.3e}", report.value_error);
            println!("max policy error: {:.3e}", report.max_policy_error);
            if !report.passed() {
                for d in &report.divergences {
                    eprintln!(
                        "  {}: expected {} got {} (tol {})",
                        d.output, d.expected, d.actual, d.tolerance
                    );
                }
                bail!("{} output(s) diverged", report.divergences.len());
            }
            println!("OK");
        }
    }
    Ok(())
}
