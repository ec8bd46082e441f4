//! hush - 音频误差最小化噪声命令行工具
//!
//! 子命令:
//! - `generate`: 在数据集上交替训练分类器与精炼噪声, 输出噪声文件与示例
//! - `apply`: 把已保存的噪声加到数据集上, 按原目录结构写出
//! - `inspect`: 以 JSON 打印噪声文件概况

mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{error, info};
use serde::Serialize;

use hush_model::ConvClassifier;
use hush_train::{
    AlternatingTrainer, AudioDataset, GeneratorConfig, NoiseStore, RunArtifacts, StorageMode,
    write_noisy_dataset,
};

/// 未收敛时的退出码
const EXIT_NOT_CONVERGED: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "hush-cli", version, about = "音频误差最小化噪声生成工具")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// 日志级别 (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 生成噪声
    Generate(GenerateArgs),
    /// 把噪声加到数据集上
    Apply(ApplyArgs),
    /// 查看噪声文件
    Inspect(InspectArgs),
}

#[derive(Args, Debug)]
struct GenerateArgs {
    /// 数据集根目录 (root/<label>/*.wav)
    #[arg(short, long)]
    data: PathBuf,

    /// 输出目录
    #[arg(short, long)]
    out: PathBuf,

    /// JSON 配置文件, 命令行参数优先
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 噪声文件写出整段掩码而不是只写放置区间
    #[arg(long)]
    full: bool,

    #[arg(long)]
    batch_size: Option<usize>,

    /// 平均损失低于该值时停止
    #[arg(long)]
    target_error_rate: Option<f64>,

    #[arg(long)]
    max_epsilon: Option<f32>,

    #[arg(long)]
    segment_size: Option<usize>,

    #[arg(long)]
    step_size_factor: Option<f32>,

    /// 每轮训练的 mini-batch 数
    #[arg(long)]
    train_step: Option<usize>,

    /// 每次扰动搜索的迭代次数
    #[arg(long)]
    num_steps: Option<usize>,

    /// 噪声放置模式 (center / random)
    #[arg(long)]
    placement: Option<String>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    waveform_len: Option<usize>,

    #[arg(long)]
    noise_len: Option<usize>,

    #[arg(long)]
    max_rounds: Option<usize>,
}

impl GenerateArgs {
    fn apply_overrides(&self, config: &mut GeneratorConfig) {
        macro_rules! set {
            ($args:ident, $config:ident; $($field:ident),* $(,)?) => {
                $(
                    if let Some(v) = &$args.$field {
                        $config.$field = v.clone();
                    }
                )*
            };
        }
        set!(
            self,
            config;
            batch_size,
            target_error_rate,
            max_epsilon,
            segment_size,
            step_size_factor,
            train_step,
            num_steps,
            placement,
            seed,
            waveform_len,
            max_rounds,
        );
        if self.noise_len.is_some() {
            config.noise_len = self.noise_len;
        }
    }
}

#[derive(Args, Debug)]
struct ApplyArgs {
    /// 数据集根目录, 必须与生成时相同
    #[arg(short, long)]
    data: PathBuf,

    /// 噪声文件
    #[arg(short, long)]
    noise: PathBuf,

    /// 输出目录
    #[arg(short, long)]
    out: PathBuf,

    /// 数据集打乱种子, 必须与生成时相同
    #[arg(long, default_value_t = 8)]
    seed: u64,

    /// 输出 WAV 的采样率
    #[arg(long, default_value_t = 16000)]
    sample_rate: u32,
}

#[derive(Args, Debug)]
struct InspectArgs {
    /// 噪声文件
    #[arg(short, long)]
    noise: PathBuf,
}

#[derive(Serialize)]
struct NoiseSummary {
    samples: usize,
    waveform_len: usize,
    version: u64,
    max_abs_noise: f32,
    min_noise_len: usize,
    max_noise_len: usize,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = logging::init("hush-cli", cli.verbose) {
        eprintln!("警告: 日志初始化失败: {e:#}");
    }

    let result = match &cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Apply(args) => run_apply(args).map(|()| true),
        Command::Inspect(args) => run_inspect(args).map(|()| true),
    };
    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(EXIT_NOT_CONVERGED),
        Err(e) => {
            error!("{e:#}");
            eprintln!("错误: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// 返回是否收敛
fn run_generate(args: &GenerateArgs) -> Result<bool> {
    let mut config = match &args.config {
        Some(path) => GeneratorConfig::from_json_file(path)
            .with_context(|| format!("读取配置文件 '{}' 失败", path.display()))?,
        None => GeneratorConfig::default(),
    };
    args.apply_overrides(&mut config);
    config.validate().context("配置无效")?;

    let dataset = AudioDataset::load_dir(&args.data, config.waveform_len, config.seed)
        .with_context(|| format!("加载数据集 '{}' 失败", args.data.display()))?;
    let model = ConvClassifier::new(config.classifier_config(dataset.num_classes()))?;
    info!(
        "hush 版本 {}: {} 个样本, {} 类, 分类器参数 {} 个",
        env!("CARGO_PKG_VERSION"),
        dataset.len(),
        dataset.num_classes(),
        model.parameter_count()
    );

    let mut trainer = AlternatingTrainer::new(config.clone(), &dataset, model)?;
    let clean = trainer.evaluate_clean()?;
    info!(
        "原始数据: 平均损失 {:.4}, 误分类率 {:.4}",
        clean.avg_loss, clean.error_rate
    );

    let outcome = trainer.run().context("交替优化失败")?;
    let artifacts = RunArtifacts {
        config: &config,
        dataset: &dataset,
        store: trainer.store(),
        plans: trainer.plans(),
        outcome: &outcome,
        history: trainer.history(),
    };
    let mode = if args.full {
        StorageMode::Full
    } else {
        StorageMode::Compact
    };
    let noise_path = artifacts
        .write_all(&args.out, mode)
        .with_context(|| format!("写出产物到 '{}' 失败", args.out.display()))?;
    info!("噪声已保存到 {}", noise_path.display());
    Ok(outcome.is_converged())
}

fn run_apply(args: &ApplyArgs) -> Result<()> {
    let store = NoiseStore::load(&args.noise)
        .with_context(|| format!("读取噪声文件 '{}' 失败", args.noise.display()))?;
    let dataset = AudioDataset::load_dir(&args.data, store.waveform_len(), args.seed)
        .with_context(|| format!("加载数据集 '{}' 失败", args.data.display()))?;
    write_noisy_dataset(&dataset, &store, &args.out, args.sample_rate)?;
    Ok(())
}

fn run_inspect(args: &InspectArgs) -> Result<()> {
    let store = NoiseStore::load(&args.noise)
        .with_context(|| format!("读取噪声文件 '{}' 失败", args.noise.display()))?;
    let lens = store.placements().iter().map(|p| p.len());
    let summary = NoiseSummary {
        samples: store.len(),
        waveform_len: store.waveform_len(),
        version: store.version(),
        max_abs_noise: store.max_abs(),
        min_noise_len: lens.clone().min().unwrap_or(0),
        max_noise_len: lens.max().unwrap_or(0),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
