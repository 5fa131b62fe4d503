//! Training loops shared by the digit models.

pub mod adversarial;
pub mod classifier;
pub mod session;

pub use adversarial::{GanTrainer, StepLosses};
pub use classifier::{check_accuracy, fit, train_epoch, Accuracy, EpochSummary};
pub use session::TrainingSession;

use log::trace;

use crate::{
    error::Result,
    graph::{Graph, Var},
    models::InputLayout,
    optim::Optimizer,
    params::ParamStore,
    tensor::Tensor,
};

/// Clears `store`, backpropagates `loss` and applies one optimizer step.
///
/// Gradients that `loss` produces for parameters of other stores are
/// dropped, so the same graph can be used to update another model
/// afterwards.
pub fn optimize(loss: Var<'_>, store: &mut ParamStore, opt: &mut impl Optimizer) -> Result<()> {
    store.zero_grad();
    let grads = loss.backward()?;
    store.accumulate(&grads)?;
    opt.step(store)?;
    trace!("store {} stepped, loss {:.6}", store.id(), loss.item());

    Ok(())
}

/// Puts a batch on the graph in the layout a model expects.
pub fn input<'g>(g: &'g Graph, inputs: &Tensor, layout: InputLayout) -> Var<'g> {
    let inputs = match layout {
        InputLayout::Flat => inputs.clone().flatten(),
        InputLayout::Spatial => inputs.clone(),
    };

    g.constant(inputs)
}
