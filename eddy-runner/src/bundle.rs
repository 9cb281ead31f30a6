use std::sync::Arc;

use eddy_core::{BundleId, CollectionId, EncodedKey, Error, Result, Timestamp, Value, Window, WindowedValue};
use serde::{Deserialize, Serialize};

/// Output of an evaluator before the evaluation context commits it.
#[derive(Debug, Clone, Default)]
pub struct UncommittedBundle {
    /// `None` for the impulse bundles that drive root steps.
    pub collection: Option<CollectionId>,
    pub key: Option<EncodedKey>,
    pub elements: Vec<WindowedValue>,
}

impl UncommittedBundle {
    pub fn new(collection: Option<CollectionId>) -> Self {
        Self { collection, key: None, elements: Vec::new() }
    }

    pub fn keyed(collection: Option<CollectionId>, key: Option<EncodedKey>) -> Self {
        Self { collection, key, elements: Vec::new() }
    }

    pub fn add(&mut self, element: WindowedValue) {
        self.elements.push(element);
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub(crate) fn commit(self, id: BundleId, synchronized_processing_time: Timestamp) -> CommittedBundle {
        CommittedBundle(Arc::new(BundleInner {
            id,
            collection: self.collection,
            key: self.key,
            elements: self.elements,
            synchronized_processing_time,
        }))
    }
}

#[derive(Debug)]
struct BundleInner {
    id: BundleId,
    collection: Option<CollectionId>,
    key: Option<EncodedKey>,
    elements: Vec<WindowedValue>,
    synchronized_processing_time: Timestamp,
}

/// Frozen bundle; cheap to clone and hand to several consumers.
#[derive(Debug, Clone)]
pub struct CommittedBundle(Arc<BundleInner>);

impl CommittedBundle {
    pub fn id(&self) -> BundleId {
        self.0.id
    }

    pub fn collection(&self) -> Option<CollectionId> {
        self.0.collection
    }

    pub fn key(&self) -> &Option<EncodedKey> {
        &self.0.key
    }

    pub fn elements(&self) -> &[WindowedValue] {
        &self.0.elements
    }

    pub fn len(&self) -> usize {
        self.0.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.elements.is_empty()
    }

    pub fn synchronized_processing_time(&self) -> Timestamp {
        self.0.synchronized_processing_time
    }

    /// Earliest element timestamp; `None` for an empty bundle.
    pub fn min_timestamp(&self) -> Option<Timestamp> {
        self.0.elements.iter().map(|e| e.timestamp).min()
    }
}

/// All elements a grouping step saw for one key, as handed to GroupAlsoByWindow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyedWorkItem {
    pub key: Value,
    pub elements: Vec<WindowedValue>,
}

impl KeyedWorkItem {
    pub fn into_windowed(self) -> Result<WindowedValue> {
        let timestamp = self.elements.iter().map(|e| e.timestamp).min().unwrap_or(Timestamp::MIN);
        Ok(WindowedValue::new(serde_json::to_value(self)?, timestamp, vec![Window::Global]))
    }

    pub fn from_windowed(element: &WindowedValue, step: &str) -> Result<Self> {
        KeyedWorkItem::deserialize(&element.value).map_err(|e| Error::TypeCheck {
            step: step.to_string(),
            message: format!("expected a keyed work item: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn committed_bundle_reports_min_timestamp() {
        let mut b = UncommittedBundle::new(Some(CollectionId(0)));
        assert!(b.is_empty());
        b.add(WindowedValue::timestamped(json!(1), Timestamp::from_secs(5)));
        b.add(WindowedValue::timestamped(json!(2), Timestamp::from_secs(3)));
        let c = b.commit(BundleId(7), Timestamp::ZERO);
        assert_eq!(c.id(), BundleId(7));
        assert_eq!(c.min_timestamp(), Some(Timestamp::from_secs(3)));
        assert_eq!(UncommittedBundle::new(None).commit(BundleId(8), Timestamp::ZERO).min_timestamp(), None);
    }

    #[test]
    fn keyed_work_item_is_stamped_at_earliest_element() {
        let kwi = KeyedWorkItem {
            key: json!("a"),
            elements: vec![
                WindowedValue::timestamped(json!(["a", 1]), Timestamp::from_secs(9)),
                WindowedValue::timestamped(json!(["a", 2]), Timestamp::from_secs(4)),
            ],
        };
        let wv = kwi.clone().into_windowed().unwrap();
        assert_eq!(wv.timestamp, Timestamp::from_secs(4));
        assert_eq!(KeyedWorkItem::from_windowed(&wv, "GBK").unwrap(), kwi);
        assert!(matches!(
            KeyedWorkItem::from_windowed(&WindowedValue::in_global_window(json!(1)), "GBK"),
            Err(Error::TypeCheck { .. })
        ));
    }
}
