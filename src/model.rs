use std::ops::Range;

use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::{init, loss, Optimizer, VarBuilder, VarMap, SGD};
use tracing::info;

use crate::app::GlobalEvaluator;
use crate::error::{FlError, Result};
use crate::types::{NdArray, Parameters};

pub const IMAGE_DIM: usize = 784;
pub const LABELS: usize = 10;

/// Local model plus the data it trains and validates on.
pub trait Learner: Send {
    fn get_weights(&self) -> Result<Parameters>;
    fn set_weights(&mut self, parameters: &Parameters) -> Result<()>;
    /// Trains for `epochs` passes and returns the mean training loss.
    fn train(&mut self, epochs: usize, learning_rate: f64) -> Result<f64>;
    /// (loss, accuracy) on the local validation split.
    fn test(&self) -> Result<(f64, f64)>;
    fn num_train_examples(&self) -> usize;
    fn num_test_examples(&self) -> usize;
}

/// Images `[N, dim]` f32 with labels `[N]` u32.
#[derive(Clone)]
pub struct Split {
    pub images: Tensor,
    pub labels: Tensor,
}

impl Split {
    pub fn len(&self) -> usize { self.images.dims().first().copied().unwrap_or(0) }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn slice(&self, range: Range<usize>) -> Result<Split> {
        Ok(Split {
            images: self.images.narrow(0, range.start, range.len())?,
            labels: self.labels.narrow(0, range.start, range.len())?,
        })
    }
}

pub fn array_to_tensor(array: &NdArray, device: &Device) -> Result<Tensor> {
    Ok(Tensor::from_vec(array.values.clone(), array.shape.clone(), device)?)
}

pub fn tensor_to_array(t: &Tensor) -> Result<NdArray> {
    Ok(NdArray::new(t.dims().to_vec(), t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?))
}

/// Single linear layer with softmax cross-entropy.
pub struct LinearClassifier {
    weight: Tensor,
    bias: Tensor,
    device: Device,
}

impl LinearClassifier {
    pub const PARAM_NAMES: [&'static str; 2] = ["weight", "bias"];

    pub fn init(in_dim: usize, out_dim: usize, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let weight = vs.get_with_hints((out_dim, in_dim), "weight", init::DEFAULT_KAIMING_NORMAL)?;
        let bias = vs.get_with_hints(out_dim, "bias", init::ZERO)?;
        Ok(Self { weight, bias, device: device.clone() })
    }

    pub fn from_parameters(parameters: &Parameters, device: &Device) -> Result<Self> {
        let [weight, bias] = parameters.arrays.as_slice() else {
            return Err(FlError::ArrayCountMismatch { expected: 2, actual: parameters.arrays.len() });
        };
        Ok(Self { weight: array_to_tensor(weight, device)?, bias: array_to_tensor(bias, device)?, device: device.clone() })
    }

    pub fn to_parameters(&self) -> Result<Parameters> {
        Ok(Parameters::new(vec![tensor_to_array(&self.weight)?, tensor_to_array(&self.bias)?]))
    }

    /// Replaces the weights; the layout must match the current one.
    pub fn load_parameters(&mut self, parameters: &Parameters) -> Result<()> {
        let current = Parameters::new(vec![
            NdArray::zeros(self.weight.dims().to_vec()),
            NdArray::zeros(self.bias.dims().to_vec()),
        ]);
        current.check_compatible(parameters)?;
        *self = Self::from_parameters(parameters, &self.device)?;
        Ok(())
    }

    fn logits(weight: &Tensor, bias: &Tensor, xs: &Tensor) -> Result<Tensor> {
        Ok(xs.matmul(&weight.t()?)?.broadcast_add(bias)?)
    }

    /// Mini-batch SGD over `data`; returns the mean batch loss.
    pub fn train(&mut self, data: &Split, epochs: usize, learning_rate: f64, batch_size: usize) -> Result<f64> {
        let w = Var::from_tensor(&self.weight)?;
        let b = Var::from_tensor(&self.bias)?;
        let mut sgd = SGD::new(vec![w.clone(), b.clone()], learning_rate)?;
        let n = data.len();
        let bs = batch_size.max(1);
        let mut total = 0f64;
        let mut steps = 0usize;
        for _ in 0..epochs {
            let mut start = 0;
            while start < n {
                let len = bs.min(n - start);
                let xs = data.images.narrow(0, start, len)?;
                let ys = data.labels.narrow(0, start, len)?;
                let logits = Self::logits(w.as_tensor(), b.as_tensor(), &xs)?;
                let batch_loss = loss::cross_entropy(&logits, &ys)?;
                sgd.backward_step(&batch_loss)?;
                total += batch_loss.to_scalar::<f32>()? as f64;
                steps += 1;
                start += len;
            }
        }
        drop(sgd);
        self.weight = w.into_inner();
        self.bias = b.into_inner();
        Ok(if steps == 0 { 0.0 } else { total / steps as f64 })
    }

    /// (mean loss, accuracy) over `data`.
    pub fn test(&self, data: &Split) -> Result<(f64, f64)> {
        if data.is_empty() {
            return Ok((0.0, 0.0));
        }
        let logits = Self::logits(&self.weight, &self.bias, &data.images)?;
        let test_loss = loss::cross_entropy(&logits, &data.labels)?.to_scalar::<f32>()? as f64;
        let correct = logits
            .argmax(D::Minus1)?
            .eq(&data.labels)?
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_scalar::<f32>()? as f64;
        Ok((test_loss, correct / data.len() as f64))
    }
}

/// Contiguous IID shard `index` of `total` over `n` items; the remainder goes to the first shards.
pub fn shard_range(n: usize, index: usize, total: usize) -> Range<usize> {
    let total = total.max(1);
    let base = n / total;
    let rem = n % total;
    let start = index * base + rem.min(index);
    let len = base + usize::from(index < rem);
    start..(start + len)
}

/// Splits a shard into (train, validation), validation taken from the tail.
pub fn split_train_val(range: Range<usize>, val_fraction: f64) -> (Range<usize>, Range<usize>) {
    let val_len = ((range.len() as f64) * val_fraction).round() as usize;
    let cut = range.end - val_len.min(range.len());
    (range.start..cut, cut..range.end)
}

pub struct MnistData {
    pub train: Split,
    pub test: Split,
}

pub fn load_mnist(device: &Device) -> Result<MnistData> {
    let m = candle_datasets::vision::mnist::load()?;
    let data = MnistData {
        train: Split {
            images: m.train_images.to_device(device)?,
            labels: m.train_labels.to_dtype(DType::U32)?.to_device(device)?,
        },
        test: Split {
            images: m.test_images.to_device(device)?,
            labels: m.test_labels.to_dtype(DType::U32)?.to_device(device)?,
        },
    };
    info!(train = data.train.len(), test = data.test.len(), "loaded MNIST");
    Ok(data)
}

/// One partition of the training set bound to a local classifier.
pub struct MnistLearner {
    model: LinearClassifier,
    train: Split,
    val: Split,
    batch_size: usize,
}

impl MnistLearner {
    pub const VAL_FRACTION: f64 = 0.2;

    pub fn new(model: LinearClassifier, train: Split, val: Split, batch_size: usize) -> Self {
        Self { model, train, val, batch_size }
    }

    pub fn for_partition(
        data: &MnistData,
        partition_id: usize,
        num_partitions: usize,
        batch_size: usize,
        device: &Device,
    ) -> Result<Self> {
        let shard = shard_range(data.train.len(), partition_id, num_partitions);
        let (train, val) = split_train_val(shard, Self::VAL_FRACTION);
        Ok(Self::new(
            LinearClassifier::init(IMAGE_DIM, LABELS, device)?,
            data.train.slice(train)?,
            data.train.slice(val)?,
            batch_size,
        ))
    }
}

impl Learner for MnistLearner {
    fn get_weights(&self) -> Result<Parameters> { self.model.to_parameters() }

    fn set_weights(&mut self, parameters: &Parameters) -> Result<()> { self.model.load_parameters(parameters) }

    fn train(&mut self, epochs: usize, learning_rate: f64) -> Result<f64> {
        self.model.train(&self.train, epochs, learning_rate, self.batch_size)
    }

    fn test(&self) -> Result<(f64, f64)> { self.model.test(&self.val) }

    fn num_train_examples(&self) -> usize { self.train.len() }

    fn num_test_examples(&self) -> usize { self.val.len() }
}

/// Held-out split the server scores the global model on.
pub struct GlobalTestSet {
    data: Split,
    device: Device,
}

impl GlobalTestSet {
    pub fn new(data: Split, device: &Device) -> Self {
        Self { data, device: device.clone() }
    }
}

impl GlobalEvaluator for GlobalTestSet {
    fn evaluate(&self, parameters: &Parameters) -> Result<(f64, f64)> {
        LinearClassifier::from_parameters(parameters, &self.device)?.test(&self.data)
    }
}
