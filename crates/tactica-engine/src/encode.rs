//! Context feature encoding
//!
//! Turns a raw request context (a JSON object, already enriched upstream)
//! into a fixed-length numeric vector via feature hashing. Pure and
//! deterministic: no learned state, no randomness, no vocabulary growth.
//! Hash collisions are accepted as a small, bounded approximation error in
//! exchange for a fixed dimensionality.

use serde_json::Value;

/// Raw request context as seen by the engine
pub type Context = serde_json::Map<String, Value>;

/// Coordinate 0 is always 1.0 so every head learns an intercept
const BIAS_INDEX: usize = 0;

/// Deterministic feature-hashing encoder
#[derive(Debug, Clone)]
pub struct FeatureEncoder {
    dim: usize,
}

impl FeatureEncoder {
    /// Create an encoder producing `dim`-length vectors. `dim` must leave
    /// room for the bias coordinate plus at least one hashed coordinate.
    pub fn new(dim: usize) -> Self {
        assert!(dim >= 2, "encoder dim must be >= 2");
        Self { dim }
    }

    /// Output dimensionality
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Encode a context into a `dim`-length vector.
    ///
    /// - scalar fields contribute their value at the hashed coordinate of
    ///   the field name
    /// - categorical and boolean fields contribute 1.0 at the hashed
    ///   coordinate of the (name, value) pair
    /// - nested values are flattened with a dotted key prefix
    /// - nulls are skipped
    pub fn encode(&self, context: &Context) -> Vec<f64> {
        let mut x = vec![0.0; self.dim];
        x[BIAS_INDEX] = 1.0;
        for (key, value) in context {
            self.fold_value(&mut x, key, value);
        }
        x
    }

    fn fold_value(&self, x: &mut [f64], key: &str, value: &Value) {
        match value {
            Value::Null => {}
            Value::Bool(b) => {
                let coord = self.index_for(&format!("{}={}", key, b));
                x[coord] += 1.0;
            }
            Value::Number(n) => {
                let v = n.as_f64().unwrap_or(0.0);
                if v.is_finite() {
                    x[self.index_for(key)] += v;
                }
            }
            Value::String(s) => {
                let coord = self.index_for(&format!("{}={}", key, s));
                x[coord] += 1.0;
            }
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    self.fold_value(x, &format!("{}.{}", key, i), item);
                }
            }
            Value::Object(map) => {
                for (sub, item) in map {
                    self.fold_value(x, &format!("{}.{}", key, sub), item);
                }
            }
        }
    }

    /// Hash a feature key into a non-bias coordinate
    fn index_for(&self, key: &str) -> usize {
        let h = hash64(key.as_bytes());
        1 + (h as usize % (self.dim - 1))
    }
}

/// Stable exploration seed for a request.
///
/// Derived from (mode, task_key, goal, risk_level) only, so repeated
/// requests with identical context reproduce the same exploration sample
/// and Thompson draws. Absent fields hash as empty strings.
pub fn context_seed(mode: &str, context: &Context) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(mode.as_bytes());
    for field in ["task_key", "goal", "risk_level"] {
        hasher.update(&[0x1f]);
        if let Some(Value::String(s)) = context.get(field) {
            hasher.update(s.as_bytes());
        }
    }
    let digest = hasher.finalize();
    u64::from_le_bytes(digest.as_bytes()[..8].try_into().unwrap())
}

fn hash64(bytes: &[u8]) -> u64 {
    let digest = blake3::hash(bytes);
    u64::from_le_bytes(digest.as_bytes()[..8].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: Value) -> Context {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_encode_is_deterministic() {
        let encoder = FeatureEncoder::new(32);
        let c = ctx(json!({"goal": "summarize", "tokens": 120.0, "urgent": true}));
        assert_eq!(encoder.encode(&c), encoder.encode(&c));
    }

    #[test]
    fn test_bias_coordinate_always_set() {
        let encoder = FeatureEncoder::new(16);
        let empty = Context::new();
        let x = encoder.encode(&empty);
        assert_eq!(x[0], 1.0);
        assert!(x[1..].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_scalar_value_weighted_categorical_unit() {
        let encoder = FeatureEncoder::new(64);
        let c1 = ctx(json!({"tokens": 2.0}));
        let c2 = ctx(json!({"tokens": 4.0}));
        let x1 = encoder.encode(&c1);
        let x2 = encoder.encode(&c2);
        // same coordinate, doubled weight
        let (i1, v1) = x1.iter().enumerate().skip(1).find(|(_, v)| **v != 0.0).unwrap();
        let (i2, v2) = x2.iter().enumerate().skip(1).find(|(_, v)| **v != 0.0).unwrap();
        assert_eq!(i1, i2);
        assert!((v2 / v1 - 2.0).abs() < 1e-12);

        // distinct categorical values land on distinct coordinates
        let a = encoder.encode(&ctx(json!({"lang": "en"})));
        let b = encoder.encode(&ctx(json!({"lang": "fr"})));
        assert_ne!(a, b);
    }

    #[test]
    fn test_seed_depends_only_on_named_fields() {
        let base = ctx(json!({"task_key": "t1", "goal": "g", "risk_level": "low"}));
        let mut noisy = base.clone();
        noisy.insert("scratch".to_string(), json!("ignored"));

        assert_eq!(context_seed("m", &base), context_seed("m", &noisy));
        assert_ne!(context_seed("m", &base), context_seed("other", &base));

        let mut riskier = base.clone();
        riskier.insert("risk_level".to_string(), json!("high"));
        assert_ne!(context_seed("m", &base), context_seed("m", &riskier));
    }
}
