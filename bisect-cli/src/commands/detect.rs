use crate::output;

use std::fs;
use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;

use bisect_service::detector::cluster_and_find_split;

/// Find change points in a series of values
#[derive(Args, Debug)]
pub struct DetectArgs {
    /// Values in order
    #[arg(value_name = "VALUE", allow_negative_numbers = true, required_unless_present = "file")]
    pub values: Vec<f64>,

    /// Read values from a YAML or JSON list instead
    #[arg(long, short = 'f', value_name = "FILE", conflicts_with = "values")]
    pub file: Option<PathBuf>,

    /// Seed of the permutation test
    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Print the splits as JSON
    #[arg(long)]
    pub json: bool,
}

fn parse_values(content: &str) -> Result<Vec<f64>> {
    Ok(serde_yaml::from_str(content)?)
}

pub fn execute(args: DetectArgs) -> Result<()> {
    let values = match &args.file {
        Some(path) => parse_values(&fs::read_to_string(path)?)?,
        None => args.values,
    };
    output::status("Detecting", &format!("{} values", values.len()));

    let mut rng = StdRng::seed_from_u64(args.seed);
    let splits = match cluster_and_find_split(&values, &mut rng) {
        Ok(splits) => splits,
        Err(e) => {
            if args.json {
                println!("[]");
            }
            output::warning(&e.to_string());
            return Ok(());
        }
    };

    if args.json {
        println!("{}", serde_json::to_string(&splits)?);
        return Ok(());
    }
    for (index, (low, high)) in &splits {
        println!("{}\t{}..={}", index, low, high);
    }
    output::success(&format!("{} change point(s)", splits.len()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_values() {
        assert_eq!(parse_values("[1, 2.5, 3]").unwrap(), vec![1.0, 2.5, 3.0]);
        assert_eq!(parse_values("- 4\n- 5\n").unwrap(), vec![4.0, 5.0]);
        assert!(parse_values("not a list").is_err());
    }
}
