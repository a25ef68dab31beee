//! CLI for building, querying and inspecting ANN indices over dataset files

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ann_from_scratch::persistence::dataset_file::{self, DatasetFile};
use ann_from_scratch::{
    compute_cluster_centers, CentersInit, Checks, DistanceMetric, Element, Index,
    Parameters, SearchParams,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ndarray::Array2;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;

#[derive(Parser)]
#[command(name = "ann")]
#[command(about = "Approximate nearest-neighbor indexing built from scratch in Rust", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy)]
enum AlgorithmArg {
    Linear,
    Kdtree,
    KdtreeSingle,
    Kmeans,
    Composite,
    Lsh,
    Hierarchical,
    Autotuned,
}

#[derive(ValueEnum, Clone, Copy)]
enum InitArg {
    Random,
    Gonzales,
    Kmeanspp,
    Groupwise,
}

#[derive(Args)]
struct IndexArgs {
    /// Backend to build
    #[arg(long, value_enum, default_value = "kdtree")]
    algorithm: AlgorithmArg,

    /// Read all parameters from a JSON file instead of the flags below
    #[arg(long)]
    params: Option<PathBuf>,

    /// Distance metric (euclidean, manhattan, minkowski:<p>, max, hist-intersect,
    /// hellinger, chi-square, kl, hamming, hamming-lut)
    #[arg(long, default_value = "euclidean")]
    distance: String,

    #[arg(long, default_value = "4")]
    trees: usize,

    #[arg(long, default_value = "32")]
    branching: usize,

    #[arg(long, value_enum, default_value = "random")]
    centers_init: InitArg,

    #[arg(long, default_value = "12")]
    tables: usize,

    #[arg(long, default_value = "20")]
    key_size: u32,

    #[arg(long, default_value = "2")]
    probe_level: u32,

    /// Target precision when autotuning
    #[arg(long, default_value = "0.9")]
    target_precision: f32,

    #[arg(long, default_value = "0")]
    seed: u64,

    /// Worker threads (0 or 1 = sequential)
    #[arg(long, default_value = "0")]
    cores: usize,
}

#[derive(Args)]
struct BuildArgs {
    data: PathBuf,
    /// Where to write the index
    #[arg(short, long)]
    out: PathBuf,
    #[command(flatten)]
    index: IndexArgs,
}

#[derive(Args)]
struct QueryArgs {
    data: PathBuf,
    /// Saved index built over `data`
    #[arg(short, long)]
    index: PathBuf,
    /// Dataset file holding the query points
    #[arg(short, long)]
    queries: PathBuf,
    #[arg(short, long, default_value = "5")]
    k: usize,
    /// Leaf checks per query; omit to use the saved setting
    #[arg(long)]
    checks: Option<usize>,
    #[arg(long, default_value = "0")]
    cores: usize,
}

#[derive(Args)]
struct ClusterArgs {
    data: PathBuf,
    #[arg(short, long)]
    clusters: usize,
    #[command(flatten)]
    index: IndexArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a dataset file of uniformly random f32 points
    Generate {
        out: PathBuf,
        #[arg(long)]
        rows: usize,
        #[arg(long)]
        cols: usize,
        #[arg(long, default_value = "0")]
        seed: u64,
    },
    /// Print the shape and element type of a dataset file
    Info { data: PathBuf },
    /// Build an index over a dataset file and save it
    Build(BuildArgs),
    /// Search a saved index with the rows of a query file
    Query(QueryArgs),
    /// Print k-means cluster centers of a dataset file
    Cluster(ClusterArgs),
}

/// A command that reads a dataset file and runs at its element type.
enum Job {
    Build(BuildArgs),
    Query(QueryArgs),
    Cluster(ClusterArgs),
}

impl Job {
    fn data(&self) -> &Path {
        match self {
            Job::Build(args) => &args.data,
            Job::Query(args) => &args.data,
            Job::Cluster(args) => &args.data,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ann_from_scratch=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let job = match cli.command {
        Commands::Generate { out, rows, cols, seed } => return generate(&out, rows, cols, seed),
        Commands::Info { data } => return info(&data),
        Commands::Build(args) => Job::Build(args),
        Commands::Query(args) => Job::Query(args),
        Commands::Cluster(args) => Job::Cluster(args),
    };
    let tag = dataset_file::read_header(job.data())?.type_tag;
    dispatch(tag, job)
}

/// Run a data-bearing command with the element type recorded in the file.
fn dispatch(tag: u8, job: Job) -> Result<()> {
    match tag {
        t if t == <f32 as Element>::TYPE_TAG => run::<f32>(job),
        t if t == <f64 as Element>::TYPE_TAG => run::<f64>(job),
        t if t == <i8 as Element>::TYPE_TAG => run::<i8>(job),
        t if t == <i16 as Element>::TYPE_TAG => run::<i16>(job),
        t if t == <i32 as Element>::TYPE_TAG => run::<i32>(job),
        t if t == <u8 as Element>::TYPE_TAG => run::<u8>(job),
        t if t == <u16 as Element>::TYPE_TAG => run::<u16>(job),
        t if t == <u32 as Element>::TYPE_TAG => run::<u32>(job),
        other => bail!("Unknown element type tag {}", other),
    }
}

fn run<T: Element>(job: Job) -> Result<()>
where
    T::Distance: std::fmt::Display,
{
    match job {
        Job::Build(BuildArgs { data, out, index }) => {
            let params = parameters(&index)?;
            let dataset = dataset_file::read_dataset::<T>(&data)?;
            let built = Index::build(dataset, &params)?;
            built
                .save_file(&out)
                .with_context(|| format!("Failed to write {}", out.display()))?;

            println!(
                "Built {:?} index over {} points ({} bytes)",
                built.algorithm(),
                built.len(),
                built.used_memory()
            );
            if let Some(report) = built.autotune_report() {
                println!(
                    "Autotune: checks={} precision={:.3} target={:.3} met={} speedup={:.1}x",
                    report.checks, report.precision, report.target_precision, report.met_target, report.speedup
                );
            }
            println!("Saved to {}", out.display());
        }
        Job::Query(QueryArgs {
            data,
            index,
            queries,
            k,
            checks,
            cores,
        }) => {
            let dataset = dataset_file::read_dataset::<T>(&data)?;
            let loaded = Index::load_file(&index, dataset)
                .with_context(|| format!("Failed to load {}", index.display()))?;
            let queries = dataset_file::read_dataset::<T>(&queries)?;

            let mut search = SearchParams::from(loaded.parameters()).with_cores(cores);
            if let Some(checks) = checks {
                search.checks = Checks::Exact(checks);
            }
            let results = loaded.knn_search_with(queries.as_flat(), k, &search)?;
            for (i, neighbors) in results.iter().enumerate() {
                println!("Query {}:", i);
                for (rank, n) in neighbors.iter().enumerate() {
                    println!("  {}. {} (distance: {:.4})", rank + 1, n.id, n.distance);
                }
            }
        }
        Job::Cluster(ClusterArgs { data, clusters, index }) => {
            let params = parameters(&index)?;
            let dataset = dataset_file::read_dataset::<T>(&data)?;
            let centers = compute_cluster_centers(&dataset, clusters, &params)?;
            println!("{} of {} requested centers:", centers.nrows(), clusters);
            for row in centers.rows() {
                let values: Vec<String> = row.iter().map(|v| format!("{:.4}", v)).collect();
                println!("  [{}]", values.join(", "));
            }
        }
    }
    Ok(())
}

fn info(data: &Path) -> Result<()> {
    let header = dataset_file::read_header(data)?;
    println!(
        "{}: {} rows x {} cols, element type tag {}",
        data.display(),
        header.rows,
        header.cols,
        header.type_tag
    );
    Ok(())
}

fn parameters(args: &IndexArgs) -> Result<Parameters> {
    if let Some(path) = &args.params {
        let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let params = Parameters::from_json(&bytes)?;
        params.validate()?;
        return Ok(params);
    }
    let distance: DistanceMetric = args.distance.parse()?;
    let base = match args.algorithm {
        AlgorithmArg::Linear => Parameters::linear(),
        AlgorithmArg::Kdtree => Parameters::kdtree(args.trees),
        AlgorithmArg::KdtreeSingle => Parameters::kdtree_single(Parameters::default().leaf_max_size),
        AlgorithmArg::Kmeans => Parameters::kmeans(args.branching, Parameters::default().iterations),
        AlgorithmArg::Composite => Parameters::composite(args.trees, args.branching),
        AlgorithmArg::Lsh => Parameters::lsh(args.tables, args.key_size, args.probe_level),
        AlgorithmArg::Hierarchical => Parameters::hierarchical(args.trees, args.branching),
        AlgorithmArg::Autotuned => Parameters::autotuned(args.target_precision, 0.01, 0.0, 0.1),
    };
    let centers_init = match args.centers_init {
        InitArg::Random => CentersInit::Random,
        InitArg::Gonzales => CentersInit::Gonzales,
        InitArg::Kmeanspp => CentersInit::KMeansPP,
        InitArg::Groupwise => CentersInit::Groupwise,
    };
    let params = base
        .with_distance(distance)
        .with_centers_init(centers_init)
        .with_seed(args.seed)
        .with_cores(args.cores);
    params.validate()?;
    tracing::debug!(?params, "Parsed parameters");
    Ok(params)
}

fn generate(out: &Path, rows: usize, cols: usize, seed: u64) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let points = Array2::random_using((rows, cols), Uniform::new(0.0f32, 1.0), &mut rng);
    let mut file = DatasetFile::<f32>::create(out, cols)?;
    let flat: Vec<f32> = points.iter().copied().collect();
    file.append(&flat)?;
    println!("Wrote {} x {} points to {}", rows, cols, out.display());
    Ok(())
}
