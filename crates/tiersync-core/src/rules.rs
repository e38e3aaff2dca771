//! Layer adjacency rules for messages and state sync

use crate::message::MessageIntent;
use crate::types::Layer;

/// Whether a message with `intent` may flow from `from` to `to`.
///
/// Executive reaches every layer with any intent. Administrative reports up
/// (report/request/alert) and commands down (command/request). Productive only
/// reports up to Administrative. Same-layer traffic is always allowed.
pub fn can_communicate(from: Layer, to: Layer, intent: MessageIntent) -> bool {
    use Layer::*;
    use MessageIntent::*;
    match (from, to) {
        (Executive, _) => true,
        (Administrative, Administrative) | (Productive, Productive) => true,
        (Administrative, Executive) | (Productive, Administrative) => {
            matches!(intent, Report | Request | Alert)
        }
        (Administrative, Productive) => matches!(intent, Command | Request),
        (Productive, Executive) => false,
    }
}

/// Layers a source layer may push state into.
pub fn sync_targets(source: Layer) -> &'static [Layer] {
    match source {
        Layer::Executive => &[Layer::Executive, Layer::Administrative],
        Layer::Administrative => &[Layer::Executive, Layer::Administrative, Layer::Productive],
        Layer::Productive => &[Layer::Administrative, Layer::Productive],
    }
}

pub fn can_sync(source: Layer, target: Layer) -> bool {
    sync_targets(source).contains(&target)
}
