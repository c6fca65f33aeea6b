#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use ndarray::{Array1, Array2};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::process;

use kexfam::config::EstimatorConfig;
use kexfam::data::load_observations;
use kexfam::estimator::KernelExpFamily;
use kexfam::memory::{DEFAULT_MEMORY_LIMIT_GIB, MemoryBudget};

#[derive(Args)]
pub struct FitArgs {
    /// Path to a headerless TSV of training points, one row per point
    pub training_data: String,

    /// Evaluate at the points of this TSV instead of the training points
    #[arg(long, value_name = "TSV")]
    pub query: Option<String>,

    /// Estimator configuration (.toml); flags below override its values
    #[arg(long, value_name = "TOML")]
    pub config: Option<String>,

    /// Gaussian kernel bandwidth
    #[arg(long)]
    pub sigma: Option<f64>,

    /// Ridge strength
    #[arg(long)]
    pub lambda: Option<f64>,

    /// Refuse problems whose dense assembly needs more memory than this
    #[arg(long, value_name = "GIB")]
    pub memory_limit_gib: Option<f64>,

    /// Where to write log-density and gradient per query point
    #[arg(long, default_value = "log_pdf.tsv")]
    pub output: String,

    /// Also write the per-point leverage of the training data to this TSV
    #[arg(long, value_name = "TSV")]
    pub leverage: Option<String>,

    /// Size of the worker pool (defaults to one thread per core)
    #[arg(long)]
    pub threads: Option<usize>,
}

#[derive(Parser)]
#[command(
    name = "kexfam",
    version,
    about = "Nonparametric density estimation with kernel exponential families",
    long_about = "Fits an unnormalized log-density in a Gaussian RKHS by score matching \
                 and evaluates it, with its gradient, at query points."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fit an estimator and evaluate it (outputs: log_pdf.tsv)")]
    Fit(FitArgs),

    #[command(about = "Print the projected memory footprint of a problem size")]
    Budget {
        /// Number of training points
        #[arg(long, value_name = "N")]
        points: usize,

        /// Dimension of each point
        #[arg(long, value_name = "D")]
        dimensions: usize,

        #[arg(long, value_name = "GIB", default_value_t = DEFAULT_MEMORY_LIMIT_GIB)]
        memory_limit_gib: f64,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Some(Commands::Fit(args)) => fit(args),
        Some(Commands::Budget {
            points,
            dimensions,
            memory_limit_gib,
        }) => budget(points, dimensions, memory_limit_gib),
        None => Cli::command()
            .print_help()
            .map(|_| println!())
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error>),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn resolve_config(args: &FitArgs) -> Result<EstimatorConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => {
            log::info!("Loading estimator configuration from: {path}");
            EstimatorConfig::load(path)?
        }
        None => EstimatorConfig::default(),
    };
    if let Some(sigma) = args.sigma {
        config.sigma = sigma;
    }
    if let Some(lambda) = args.lambda {
        config.lambda = lambda;
    }
    if let Some(limit) = args.memory_limit_gib {
        config.memory_limit_gib = limit;
    }
    config.validate()?;
    Ok(config)
}

pub fn fit(args: FitArgs) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(threads) = args.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()?;
    }

    let config = resolve_config(&args)?;

    println!("Loading training data from: {}", args.training_data);
    let data = load_observations(&args.training_data)?;
    println!(
        "Loaded {} points in {} dimensions",
        data.ncols(),
        data.nrows()
    );

    let mut estimator = KernelExpFamily::from_config(data, &config)?;
    estimator.fit()?;
    println!("Training objective: {:.6e}", estimator.objective()?);

    if let Some(path) = &args.leverage {
        let leverage = estimator.leverage()?;
        save_leverage(&leverage, path)?;
        println!("Leverage written to: {path}");
    }

    if let Some(path) = &args.query {
        println!("Loading query points from: {path}");
        estimator.set_test_data(load_observations(path)?)?;
    }

    let log_pdf = estimator.log_pdf_multiple()?;
    let gradients = estimator.grad_multiple()?;
    save_evaluations(&log_pdf, &gradients, &args.output)?;
    println!(
        "Evaluated {} query points; results written to: {}",
        estimator.num_rhs(),
        args.output
    );
    Ok(())
}

fn budget(
    points: usize,
    dimensions: usize,
    memory_limit_gib: f64,
) -> Result<(), Box<dyn std::error::Error>> {
    let budget = MemoryBudget::for_problem(points, dimensions);
    println!("Buffers for N={points}, D={dimensions}:");
    for (name, count) in budget.buffers() {
        match count {
            Some(count) => println!("  {name:<24} {count:>20} elements"),
            None => println!("  {name:<24} {:>20}", "overflow"),
        }
    }
    println!("Required: {:.6} GiB", budget.required_gib());
    budget.enforce(memory_limit_gib)?;
    println!("Fits within the {memory_limit_gib:.6} GiB limit.");
    Ok(())
}

fn save_evaluations(
    log_pdf: &Array1<f64>,
    gradients: &Array2<f64>,
    output_path: &str,
) -> Result<(), std::io::Error> {
    let mut file = BufWriter::new(File::create(output_path)?);

    let grad_header: Vec<String> = (1..=gradients.nrows())
        .map(|i| format!("grad_{i}"))
        .collect();
    writeln!(file, "point\tlog_pdf\t{}", grad_header.join("\t"))?;

    for (j, value) in log_pdf.iter().enumerate() {
        let grad: Vec<String> = gradients.column(j).iter().map(|g| g.to_string()).collect();
        writeln!(file, "{j}\t{value}\t{}", grad.join("\t"))?;
    }
    file.flush()
}

fn save_leverage(leverage: &Array1<f64>, output_path: &str) -> Result<(), std::io::Error> {
    let mut file = BufWriter::new(File::create(output_path)?);
    writeln!(file, "point\tleverage")?;
    for (a, value) in leverage.iter().enumerate() {
        writeln!(file, "{a}\t{value}")?;
    }
    file.flush()
}
