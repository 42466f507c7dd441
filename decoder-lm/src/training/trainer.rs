//! Training loop for causal language models.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::Optimizer;
use snafu::{ensure, ResultExt, Snafu};

use crate::architectures::CausalLM;
use crate::error::BoxedError;
use crate::training::batches::{Batch, BatchError};
use crate::training::loss::{next_token_loss, LossError};

/// Errors for the training loop.
#[derive(Debug, Snafu)]
pub enum TrainerError {
    #[snafu(display("Cannot compute gradients"))]
    Backward { source: candle_core::Error },

    #[snafu(display("Cannot create batch"))]
    Batch { source: BatchError },

    #[snafu(display("Cannot clip gradients"))]
    ClipGradients { source: candle_core::Error },

    #[snafu(display("No batches to train or evaluate on"))]
    EmptyEpoch,

    #[snafu(display("Cannot apply model"))]
    Forward { source: BoxedError },

    #[snafu(display("Cannot compute loss"))]
    Loss { source: LossError },

    #[snafu(display("Loss is not finite: {loss}"))]
    NonFiniteLoss { loss: f32 },

    #[snafu(display("Cannot read loss value"))]
    ReadLoss { source: candle_core::Error },

    #[snafu(display("Cannot update parameters"))]
    Step { source: candle_core::Error },
}

/// Trainer configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct TrainerConfig {
    log_every: usize,
    max_grad_norm: Option<f64>,
}

impl TrainerConfig {
    /// Log the loss every `log_every` steps.
    ///
    /// Default: `10`
    pub fn log_every(mut self, log_every: usize) -> Self {
        self.log_every = log_every.max(1);
        self
    }

    /// Rescale gradients when their global norm exceeds this value.
    /// Gradients are not clipped when `None`.
    ///
    /// Default: `Some(1.0)`
    pub fn max_grad_norm(mut self, max_grad_norm: Option<f64>) -> Self {
        self.max_grad_norm = max_grad_norm;
        self
    }
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            log_every: 10,
            max_grad_norm: Some(1.0),
        }
    }
}

/// Loss summary of an epoch.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EpochSummary {
    /// Mean of the batch losses.
    pub mean_loss: f32,

    /// Number of batches.
    pub n_batches: usize,
}

impl EpochSummary {
    /// Perplexity, `exp(mean_loss)`.
    pub fn perplexity(&self) -> f32 {
        self.mean_loss.exp()
    }
}

/// Rescale gradients so that their global L2 norm is at most `max_norm`.
///
/// * `grads` - Gradients, updated in-place.
/// * `vars` - Variables whose gradients are clipped. Variables without
///   gradient are skipped.
/// * `max_norm` - Maximum global norm.
///
/// Returns: The global norm before clipping.
pub fn clip_grad_norm(
    grads: &mut GradStore,
    vars: &[Var],
    max_norm: f64,
) -> Result<f64, candle_core::Error> {
    let mut sum_sq = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            sum_sq += grad
                .sqr()?
                .sum_all()?
                .to_dtype(candle_core::DType::F64)?
                .to_scalar::<f64>()?;
        }
    }
    let norm = sum_sq.sqrt();

    if norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            if let Some(grad) = grads.remove(var.as_tensor()) {
                grads.insert(var.as_tensor(), (grad * scale)?);
            }
        }
    }

    Ok(norm)
}

/// Trainer for causal language models.
///
/// Each step runs the model in training mode, computes the next-piece loss,
/// backpropagates, optionally clips the gradients and updates the parameters
/// with the optimizer. Steps take `&mut self`, so a step is completed before
/// the model can be used again.
pub struct Trainer<M, O> {
    config: TrainerConfig,
    model: M,
    optimizer: O,
    step: usize,
    vars: Vec<Var>,
}

impl<M, O> Trainer<M, O>
where
    M: CausalLM,
    O: Optimizer,
{
    /// Create a trainer.
    ///
    /// * `model` - The model to train.
    /// * `optimizer` - Optimizer over `vars`.
    /// * `vars` - Trainable variables of the model.
    /// * `config` - Trainer configuration.
    pub fn new(model: M, optimizer: O, vars: Vec<Var>, config: TrainerConfig) -> Self {
        Self {
            config,
            model,
            optimizer,
            step: 0,
            vars,
        }
    }

    /// The model that is trained.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Stop training and return the model.
    pub fn into_model(self) -> M {
        self.model
    }

    /// Number of steps taken.
    pub fn steps(&self) -> usize {
        self.step
    }

    /// Set the learning rate of the optimizer.
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.optimizer.set_learning_rate(lr)
    }

    fn loss(&self, batch: &Batch, train: bool) -> Result<Tensor, TrainerError> {
        let output = self
            .model
            .forward_t(&batch.inputs, train)
            .context(ForwardSnafu)?;
        next_token_loss(output.logits(), &batch.targets).context(LossSnafu)
    }

    /// Take a single optimization step.
    ///
    /// Returns: The loss of the batch before the update.
    pub fn train_step(&mut self, batch: &Batch) -> Result<f32, TrainerError> {
        let loss = self.loss(batch, true)?;
        let loss_value = loss.to_scalar::<f32>().context(ReadLossSnafu)?;
        ensure!(loss_value.is_finite(), NonFiniteLossSnafu { loss: loss_value });

        let mut grads = loss.backward().context(BackwardSnafu)?;
        if let Some(max_grad_norm) = self.config.max_grad_norm {
            let grad_norm = clip_grad_norm(&mut grads, &self.vars, max_grad_norm)
                .context(ClipGradientsSnafu)?;
            tracing::trace!(step = self.step, grad_norm, "clipped gradients");
        }
        self.optimizer.step(&grads).context(StepSnafu)?;

        self.step += 1;
        if self.step % self.config.log_every == 0 {
            tracing::info!(step = self.step, loss = loss_value, "training step");
        } else {
            tracing::debug!(step = self.step, loss = loss_value, "training step");
        }

        Ok(loss_value)
    }

    /// Train on every batch once.
    ///
    /// * `epoch` - Epoch number, used for logging.
    /// * `batches` - Training batches.
    pub fn train_epoch(
        &mut self,
        epoch: usize,
        batches: impl IntoIterator<Item = Result<Batch, BatchError>>,
    ) -> Result<EpochSummary, TrainerError> {
        let mut loss_sum = 0f32;
        let mut n_batches = 0;
        for batch in batches {
            loss_sum += self.train_step(&batch.context(BatchSnafu)?)?;
            n_batches += 1;
        }
        ensure!(n_batches > 0, EmptyEpochSnafu);

        let summary = EpochSummary {
            mean_loss: loss_sum / n_batches as f32,
            n_batches,
        };
        tracing::info!(
            epoch,
            loss = summary.mean_loss,
            perplexity = summary.perplexity(),
            batches = n_batches,
            "finished epoch"
        );

        Ok(summary)
    }

    /// Compute the mean loss without updating the model.
    ///
    /// * `batches` - Evaluation batches.
    pub fn evaluate(
        &self,
        batches: impl IntoIterator<Item = Result<Batch, BatchError>>,
    ) -> Result<EpochSummary, TrainerError> {
        let mut loss_sum = 0f32;
        let mut n_batches = 0;
        for batch in batches {
            loss_sum += self
                .loss(&batch.context(BatchSnafu)?, false)?
                .to_scalar::<f32>()
                .context(ReadLossSnafu)?;
            n_batches += 1;
        }
        ensure!(n_batches > 0, EmptyEpochSnafu);

        let summary = EpochSummary {
            mean_loss: loss_sum / n_batches as f32,
            n_batches,
        };
        tracing::info!(
            loss = summary.mean_loss,
            perplexity = summary.perplexity(),
            "evaluated"
        );

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Var};
    use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};
    use snafu::{report, OptionExt, ResultExt, Whatever};

    use super::{clip_grad_norm, Trainer, TrainerConfig, TrainerError};
    use crate::models::transformer::{TransformerCausalLM, TransformerCausalLMConfig};
    use crate::training::batches::NextTokenBatches;
    use crate::util::tests::{assert_tensor_eq, SeededVars};

    fn tiny_config() -> TransformerCausalLMConfig {
        TransformerCausalLMConfig::default()
            .dropout(0.)
            .hidden_width(16)
            .intermediate_width(32)
            .max_seq_len(8)
            .n_heads(2)
            .n_layers(1)
            .n_pieces(12)
    }

    fn batches() -> NextTokenBatches {
        let piece_ids = (0..4).flat_map(|_| 0..12).collect();
        NextTokenBatches::new(piece_ids, 2, 6, &Device::Cpu).expect("Cannot create batches")
    }

    #[test]
    #[report]
    fn trainer_reduces_loss_on_fixed_batch() -> Result<(), Whatever> {
        let vars = SeededVars::new(&Device::Cpu);
        let model = TransformerCausalLM::new(vars.vb(), &tiny_config())
            .whatever_context("Cannot construct model")?;
        vars.init(3)?;

        let optimizer = AdamW::new(
            vars.varmap.all_vars(),
            ParamsAdamW {
                lr: 1e-2,
                ..Default::default()
            },
        )
        .whatever_context("Cannot create optimizer")?;
        let mut trainer = Trainer::new(
            model,
            optimizer,
            vars.varmap.all_vars(),
            TrainerConfig::default(),
        );

        let batches = batches();
        let batch = batches
            .iter()
            .next()
            .whatever_context("No batch")?
            .whatever_context("Cannot create batch")?;

        let initial = trainer
            .train_step(&batch)
            .whatever_context("Cannot train")?;
        let mut last = initial;
        for _ in 0..30 {
            last = trainer
                .train_step(&batch)
                .whatever_context("Cannot train")?;
        }

        assert_eq!(trainer.steps(), 31);
        assert!(last < initial, "initial: {initial}, last: {last}");

        Ok(())
    }

    #[test]
    #[report]
    fn trainer_epochs_report_mean_loss() -> Result<(), Whatever> {
        let vars = SeededVars::new(&Device::Cpu);
        let model = TransformerCausalLM::new(vars.vb(), &tiny_config())
            .whatever_context("Cannot construct model")?;
        vars.init(5)?;

        let optimizer =
            SGD::new(vars.varmap.all_vars(), 0.1).whatever_context("Cannot create optimizer")?;
        let mut trainer = Trainer::new(
            model,
            optimizer,
            vars.varmap.all_vars(),
            TrainerConfig::default().log_every(1),
        );

        let batches = batches();
        let before = trainer
            .evaluate(batches.iter())
            .whatever_context("Cannot evaluate")?;
        assert_eq!(before.n_batches, batches.len());
        assert!(before.perplexity() > 1.);

        let summary = trainer
            .train_epoch(1, batches.iter())
            .whatever_context("Cannot train epoch")?;
        assert_eq!(summary.n_batches, batches.len());
        assert_eq!(trainer.steps(), batches.len());

        Ok(())
    }

    #[test]
    fn trainer_rejects_empty_epochs() {
        let vars = SeededVars::new(&Device::Cpu);
        let model =
            TransformerCausalLM::new(vars.vb(), &tiny_config()).expect("Cannot construct model");
        let optimizer = SGD::new(vars.varmap.all_vars(), 0.1).expect("Cannot create optimizer");
        let mut trainer = Trainer::new(
            model,
            optimizer,
            vars.varmap.all_vars(),
            TrainerConfig::default(),
        );

        let empty = NextTokenBatches::new(vec![1, 2], 1, 4, &Device::Cpu)
            .expect("Cannot create batches");
        assert!(matches!(
            trainer.train_epoch(1, empty.iter()),
            Err(TrainerError::EmptyEpoch)
        ));
    }

    #[test]
    #[report]
    fn clip_grad_norm_rescales_large_gradients() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let var = Var::new(&[3f32, 4.], &device).whatever_context("Cannot create variable")?;

        // d/dx (x·x / 2) = x
        let loss = (var.as_tensor().sqr().and_then(|xs| xs.sum_all()))
            .and_then(|xs| xs / 2.)
            .whatever_context("Cannot compute loss")?;
        let mut grads = loss.backward().whatever_context("Cannot compute gradients")?;

        let norm = clip_grad_norm(&mut grads, &[var.clone()], 1.)
            .whatever_context("Cannot clip gradients")?;
        assert!((norm - 5.).abs() < 1e-6);

        let grad = grads
            .get(var.as_tensor())
            .whatever_context("Variable has no gradient")?;
        assert_tensor_eq!(
            grad,
            candle_core::Tensor::new(&[0.6f32, 0.8], &device)
                .whatever_context("Cannot create expected gradient")?,
            epsilon = 1e-5f32,
        );

        // Gradients within the bound are left alone.
        let norm = clip_grad_norm(&mut grads, &[var.clone()], 10.)
            .whatever_context("Cannot clip gradients")?;
        assert!((norm - 1.).abs() < 1e-5);

        Ok(())
    }

    #[test]
    fn optimizer_learning_rate_can_be_changed() {
        let vars = SeededVars::new(&Device::Cpu);
        let model =
            TransformerCausalLM::new(vars.vb(), &tiny_config()).expect("Cannot construct model");
        let optimizer = SGD::new(vars.varmap.all_vars(), 0.1).expect("Cannot create optimizer");
        let mut trainer = Trainer::new(
            model,
            optimizer,
            vars.varmap.all_vars(),
            TrainerConfig::default(),
        );

        trainer.set_learning_rate(0.01);
        assert_eq!(trainer.optimizer.learning_rate(), 0.01);
    }
}
