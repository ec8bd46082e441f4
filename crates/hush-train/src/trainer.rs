//! 交替双层优化.
//!
//! 每一轮依次执行:
//!
//! 1. **训练**: 在当前加噪数据上对分类器做 `train_step` 次参数更新
//! 2. **精炼噪声**: 冻结分类器, 按固定顺序对全部样本做 min-min 搜索,
//!    新噪声整体替换旧噪声
//! 3. **评估**: 在加噪数据上统计平均损失与误分类率
//!
//! 平均损失低于 `target_error_rate` 时收敛; 达到 `max_rounds` 仍未收敛时
//! 以 [`RunOutcome::NotConverged`] 结束.

use std::fmt;

use hush_attack::{AttackBatch, SegmentPlan, SegmentedMinMinAttack, placement_for};
use hush_core::{HushError, HushResult, Placement, RunningStats, SampleId};
use hush_model::loss::{count_errors, cross_entropy};
use hush_model::{Adam, Classifier, TrainSession};
use log::{debug, info, warn};
use ndarray::Array2;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::config::GeneratorConfig;
use crate::dataset::{AudioDataset, Batch, CyclicBatches};
use crate::noise_store::NoiseStore;

/// 当前所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Train,
    RefineNoise,
    Evaluate,
    Converged,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Train => "train",
            Self::RefineNoise => "refine_noise",
            Self::Evaluate => "evaluate",
            Self::Converged => "converged",
        };
        f.write_str(name)
    }
}

/// 一次评估的结果
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    /// 按样本数加权的平均损失
    pub avg_loss: f64,
    /// 按样本数加权的平均误分类率
    pub error_rate: f64,
    /// 单批损失的最大值
    pub max_batch_loss: f64,
    pub samples: usize,
}

/// 一次噪声精炼的结果
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RefineReport {
    /// 各批最后一步搜索损失的加权平均
    pub attack_loss: f64,
    /// 因梯度非有限而跳过的分段步数
    pub skipped_segments: usize,
    /// 提交后的仓库版本
    pub noise_version: u64,
    pub max_noise: f32,
}

/// 一轮的完整记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundReport {
    /// 从 1 开始的轮次
    pub round: usize,
    pub train_loss: f64,
    pub refine: RefineReport,
    pub eval: EvalReport,
}

/// 运行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// 平均损失低于阈值
    Converged { rounds: usize, eval: EvalReport },
    /// 达到轮数上限
    NotConverged { rounds: usize, last: EvalReport },
}

impl RunOutcome {
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged { .. })
    }

    pub fn rounds(&self) -> usize {
        match self {
            Self::Converged { rounds, .. } | Self::NotConverged { rounds, .. } => *rounds,
        }
    }
}

/// 交替优化器
///
/// 独占分类器与优化器; 每个样本的放置区间和分段在构造时计算一次.
pub struct AlternatingTrainer<'d, C: Classifier> {
    config: GeneratorConfig,
    dataset: &'d AudioDataset,
    model: C,
    optimizer: Adam,
    attack: SegmentedMinMinAttack,
    plans: Vec<SegmentPlan>,
    store: NoiseStore,
    train_batches: CyclicBatches<'d>,
    batch_ids: Vec<Vec<SampleId>>,
    history: Vec<RoundReport>,
    phase: Phase,
}

impl<'d, C: Classifier> AlternatingTrainer<'d, C> {
    /// 创建
    ///
    /// 校验配置, 按种子为每个样本计算放置区间与初始噪声, 并行预计算分段.
    pub fn new(config: GeneratorConfig, dataset: &'d AudioDataset, mut model: C) -> HushResult<Self> {
        config.validate()?;
        if dataset.is_empty() {
            return Err(HushError::InvalidArgument("数据集为空".into()));
        }
        if dataset.waveform_len() != config.waveform_len {
            return Err(HushError::ShapeMismatch(format!(
                "数据集波形长度 {} 与配置 {} 不一致",
                dataset.waveform_len(),
                config.waveform_len
            )));
        }
        if model.num_classes() < dataset.num_classes() {
            return Err(HushError::ShapeMismatch(format!(
                "分类器只有 {} 类, 数据集有 {} 类",
                model.num_classes(),
                dataset.num_classes()
            )));
        }
        model.set_requires_grad(false);

        let mode = config.placement_mode()?;
        let noise_len = config.effective_noise_len();
        let mut rng = StdRng::seed_from_u64(config.seed);
        let placements = (0..dataset.len())
            .map(|_| placement_for(noise_len, config.waveform_len, mode, &mut rng))
            .collect::<HushResult<Vec<Placement>>>()?;
        let store =
            NoiseStore::uniform(placements, config.waveform_len, config.init_epsilon, &mut rng)?;
        let plans = config.scheduler()?.plan_all(dataset.waveforms());

        info!(
            "交替优化初始化: {} 个样本, 噪声长度 {noise_len} ({mode}), 每样本 {} 段",
            dataset.len(),
            plans.first().map_or(0, SegmentPlan::len)
        );
        Ok(Self {
            optimizer: config.optimizer(),
            attack: SegmentedMinMinAttack::new(config.num_steps),
            train_batches: CyclicBatches::new(dataset, config.batch_size)?,
            batch_ids: dataset.batch_ids(config.batch_size),
            config,
            dataset,
            model,
            plans,
            store,
            history: Vec::new(),
            phase: Phase::Train,
        })
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn model(&self) -> &C {
        &self.model
    }

    pub fn store(&self) -> &NoiseStore {
        &self.store
    }

    /// 每个样本的分段, 按样本编号排列
    pub fn plans(&self) -> &[SegmentPlan] {
        &self.plans
    }

    pub fn history(&self) -> &[RoundReport] {
        &self.history
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// 拆出分类器与噪声仓库
    pub fn into_parts(self) -> (C, NoiseStore) {
        (self.model, self.store)
    }

    /// 训练阶段, 返回各批损失的加权平均
    pub fn train_phase(&mut self) -> HushResult<f64> {
        self.phase = Phase::Train;
        let mut stats = RunningStats::new();
        let mut session = TrainSession::begin(&mut self.model, &mut self.optimizer);
        for _ in 0..self.config.train_step {
            let batch = self.train_batches.next_batch()?;
            let noisy = noisy_audio(&self.store, &batch)?;
            let loss = session.step(noisy.view(), &batch.labels)?;
            stats.update(f64::from(loss), batch.len() as f64);
        }
        debug!(
            "训练阶段完成: {} 步, 平均损失 {:.4}",
            session.steps(),
            stats.avg()
        );
        Ok(stats.avg())
    }

    /// 精炼噪声阶段
    ///
    /// 任意一批失败时本轮噪声全部丢弃, 仓库保持原样.
    pub fn refine_noise(&mut self) -> HushResult<RefineReport> {
        self.phase = Phase::RefineNoise;
        let mut round = self.store.begin_round();
        let mut stats = RunningStats::new();
        let mut skipped_segments = 0;
        for ids in &self.batch_ids {
            let batch = self.dataset.batch(ids)?;
            let init_noise = self.store.masks(ids)?;
            let plans: Vec<&SegmentPlan> = ids.iter().map(|&id| &self.plans[id]).collect();
            let placements = ids
                .iter()
                .map(|&id| self.store.placement(id))
                .collect::<HushResult<Vec<_>>>()?;
            let outcome = self.attack.run(
                &self.model,
                &AttackBatch {
                    audio: batch.audio.view(),
                    labels: &batch.labels,
                    init_noise: init_noise.view(),
                    plans: &plans,
                    placements: &placements,
                },
            )?;
            for (eta, &id) in outcome.eta.rows().into_iter().zip(ids) {
                round.set_eta(id, eta)?;
            }
            if let Some(loss) = outcome.final_loss {
                stats.update(f64::from(loss), batch.len() as f64);
            }
            skipped_segments += outcome.skipped_segments;
        }
        self.store.commit(round)?;
        if skipped_segments > 0 {
            warn!("本轮精炼跳过了 {skipped_segments} 个梯度非有限的分段步");
        }
        Ok(RefineReport {
            attack_loss: stats.avg(),
            skipped_segments,
            noise_version: self.store.version(),
            max_noise: self.store.max_abs(),
        })
    }

    /// 在加噪数据上评估
    pub fn evaluate(&mut self) -> HushResult<EvalReport> {
        self.phase = Phase::Evaluate;
        evaluate_with(&self.model, self.dataset, &self.batch_ids, Some(&self.store))
    }

    /// 在原始数据上评估, 不改变阶段
    pub fn evaluate_clean(&self) -> HushResult<EvalReport> {
        evaluate_with(&self.model, self.dataset, &self.batch_ids, None)
    }

    /// 执行完整的一轮
    pub fn run_round(&mut self) -> HushResult<RoundReport> {
        let round = self.history.len() + 1;
        let train_loss = self.train_phase()?;
        let refine = self.refine_noise()?;
        let eval = self.evaluate()?;
        let report = RoundReport {
            round,
            train_loss,
            refine,
            eval,
        };
        info!(
            "第 {round} 轮: train_loss={:.4} attack_loss={:.4} eval_loss={:.4} error={:.4} max_noise={:.5}",
            report.train_loss,
            report.refine.attack_loss,
            report.eval.avg_loss,
            report.eval.error_rate,
            report.refine.max_noise
        );
        self.history.push(report.clone());
        Ok(report)
    }

    /// 反复执行直到收敛或达到轮数上限
    pub fn run(&mut self) -> HushResult<RunOutcome> {
        let target = self.config.target_error_rate;
        let mut last = None;
        for _ in 0..self.config.max_rounds {
            let report = self.run_round()?;
            if report.eval.avg_loss < target {
                self.phase = Phase::Converged;
                info!(
                    "第 {} 轮收敛: 平均损失 {:.4} < {target}",
                    report.round, report.eval.avg_loss
                );
                return Ok(RunOutcome::Converged {
                    rounds: report.round,
                    eval: report.eval,
                });
            }
            last = Some(report.eval);
        }
        let rounds = self.history.len();
        let last = match last {
            Some(eval) => eval,
            None => self.evaluate()?,
        };
        warn!(
            "{rounds} 轮后仍未收敛: 平均损失 {:.4} >= {target}",
            last.avg_loss
        );
        Ok(RunOutcome::NotConverged { rounds, last })
    }
}

/// 加噪并限幅后的批次波形
fn noisy_audio(store: &NoiseStore, batch: &Batch) -> HushResult<Array2<f32>> {
    let mut noisy = store.masks(&batch.ids)?;
    noisy += &batch.audio;
    noisy.mapv_inplace(|v| v.clamp(-1.0, 1.0));
    Ok(noisy)
}

fn evaluate_with<C: Classifier + ?Sized>(
    model: &C,
    dataset: &AudioDataset,
    batch_ids: &[Vec<SampleId>],
    store: Option<&NoiseStore>,
) -> HushResult<EvalReport> {
    let mut losses = RunningStats::new();
    let mut errors = RunningStats::new();
    let mut samples = 0;
    for ids in batch_ids {
        let batch = dataset.batch(ids)?;
        let log_probs = match store {
            Some(store) => model.forward(noisy_audio(store, &batch)?.view())?,
            None => model.forward(batch.audio.view())?,
        };
        let loss = cross_entropy(log_probs.view(), &batch.labels)?;
        if !loss.is_finite() {
            return Err(HushError::NonFiniteLoss {
                phase: "eval",
                value: loss,
            });
        }
        let wrong = count_errors(log_probs.view(), &batch.labels)?;
        let weight = batch.len() as f64;
        losses.update(f64::from(loss), weight);
        errors.update(wrong as f64 / weight, weight);
        samples += batch.len();
    }
    Ok(EvalReport {
        avg_loss: losses.avg(),
        error_rate: errors.avg(),
        max_batch_loss: losses.max(),
        samples,
    })
}
