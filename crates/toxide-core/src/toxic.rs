//! Toxic definitions and their byte-stream transforms.
//!
//! A toxic is one fault-injection behaviour attached to one direction of a
//! proxy. The set of behaviours is closed: [`ToxicKind`] has one variant per
//! type, each carrying typed attributes. Definitions coming from the API are
//! resolved into a [`ToxicKind`] when the toxic is attached, so an unknown
//! type or malformed attribute fails there and never mid-stream.
//!
//! ## Toxicity sampling
//!
//! | Type          | Sampled          |
//! |---------------|------------------|
//! | `latency`     | per chunk        |
//! | `bandwidth`   | per chunk        |
//! | `slicer`      | per chunk        |
//! | `timeout`     | per connection   |
//! | `reset_peer`  | per connection   |
//! | `slow_close`  | per connection   |
//! | `limit_data`  | per connection   |
//!
//! Per-connection toxics roll once, when a link first sees the toxic.

use std::time::Duration;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::batch::Batch;
use crate::direction::Direction;
use crate::error::{Result, ToxicError};
use crate::state::ToxicState;

/// How often a toxic rolls against its toxicity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sampling {
    /// Rolled for every chunk read from the socket.
    PerChunk,
    /// Rolled once per connection.
    PerConnection,
}

/// Delay each chunk by `latency ± jitter` milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyAttributes {
    pub latency: u64,
    pub jitter: u64,
}

impl LatencyAttributes {
    /// Picks the delay for one chunk.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.jitter == 0 {
            return Duration::from_millis(self.latency);
        }
        let jitter = i64::try_from(self.jitter).unwrap_or(i64::MAX);
        let latency = i64::try_from(self.latency).unwrap_or(i64::MAX);
        let millis = latency.saturating_add(rng.gen_range(-jitter..=jitter)).max(0);
        Duration::from_millis(millis as u64)
    }
}

/// Limit throughput to `rate` KB/s (1 KB = 1000 bytes). Zero means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthAttributes {
    pub rate: u64,
}

impl BandwidthAttributes {
    /// Largest piece written at once: 100ms worth of data.
    fn piece_size(&self) -> usize {
        usize::try_from(self.rate.saturating_mul(100))
            .unwrap_or(usize::MAX)
            .max(1)
    }

    /// Time it takes to send `len` bytes at this rate.
    pub fn cost(&self, len: usize) -> Duration {
        if self.rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros((len as u64).saturating_mul(1000) / self.rate)
    }

    /// Splits segments into 100ms pieces and paces each one.
    pub fn throttle(&self, batch: Batch) -> Batch {
        if self.rate == 0 {
            return batch;
        }
        let piece = self.piece_size();
        let mut segments = Vec::with_capacity(batch.segments.len());
        for segment in batch.segments {
            let mut data = segment.data.clone();
            let mut first = true;
            loop {
                let part = data.split_to(data.len().min(piece));
                let lead = if first { segment.pause } else { Duration::ZERO };
                let pause = lead + self.cost(part.len());
                segments.push(segment.follow(part, pause));
                first = false;
                if data.is_empty() {
                    break;
                }
            }
        }
        Batch {
            segments,
            close: batch.close,
        }
    }
}

/// Stop all data; close after `timeout` ms, or never when zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutAttributes {
    pub timeout: u64,
}

/// Reset the connection after `timeout` ms; zero resets immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResetPeerAttributes {
    pub timeout: u64,
}

/// Delay closing the connection by `delay` ms after EOF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlowCloseAttributes {
    pub delay: u64,
}

/// Slice data into `average_size ± size_variation` byte pieces, `delay` µs apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlicerAttributes {
    pub average_size: usize,
    pub size_variation: usize,
    pub delay: u64,
}

impl SlicerAttributes {
    fn next_size<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        let size = if self.size_variation == 0 {
            self.average_size
        } else {
            rng.gen_range(
                self.average_size.saturating_sub(self.size_variation)
                    ..=self.average_size.saturating_add(self.size_variation),
            )
        };
        size.max(1)
    }

    /// Cuts every segment into slices.
    pub fn slice<R: Rng + ?Sized>(&self, batch: Batch, rng: &mut R) -> Batch {
        let delay = Duration::from_micros(self.delay);
        let mut segments = Vec::with_capacity(batch.segments.len());
        for segment in batch.segments {
            let mut data = segment.data.clone();
            let mut first = true;
            while first || !data.is_empty() {
                let size = self.next_size(rng).min(data.len());
                let part = data.split_to(size);
                let pause = if first { segment.pause } else { delay };
                segments.push(segment.follow(part, pause));
                first = false;
            }
        }
        Batch {
            segments,
            close: batch.close,
        }
    }
}

/// Forward at most `bytes` bytes per connection, then close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitDataAttributes {
    pub bytes: u64,
}

impl LimitDataAttributes {
    /// Truncates the batch to the connection's remaining allowance.
    pub fn limit(&self, batch: Batch, state: &mut ToxicState) -> Batch {
        let mut remaining = self.bytes.saturating_sub(state.passed);
        let mut segments = Vec::with_capacity(batch.segments.len());
        for mut segment in batch.segments {
            if remaining == 0 {
                break;
            }
            if segment.len() as u64 > remaining {
                segment.data.truncate(remaining as usize);
            }
            let kept = segment.len() as u64;
            remaining -= kept;
            state.passed += kept;
            segments.push(segment);
        }
        Batch {
            segments,
            close: batch.close || state.passed >= self.bytes,
        }
    }
}

/// Toxic type with its typed attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "attributes", rename_all = "snake_case")]
pub enum ToxicKind {
    Latency(LatencyAttributes),
    Bandwidth(BandwidthAttributes),
    Timeout(TimeoutAttributes),
    ResetPeer(ResetPeerAttributes),
    SlowClose(SlowCloseAttributes),
    Slicer(SlicerAttributes),
    LimitData(LimitDataAttributes),
}

/// Maps a type name, including aliases, to its canonical wire name.
pub fn canonical_type(type_name: &str) -> Option<&'static str> {
    match type_name {
        "latency" => Some("latency"),
        "bandwidth" => Some("bandwidth"),
        "timeout" => Some("timeout"),
        "reset_peer" | "reset" => Some("reset_peer"),
        "slow_close" => Some("slow_close"),
        "slicer" => Some("slicer"),
        "limit_data" => Some("limit_data"),
        _ => None,
    }
}

fn attributes<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| ToxicError::InvalidAttributes(e.to_string()))
}

impl ToxicKind {
    /// Resolves a type name and raw attributes into a validated kind.
    ///
    /// Missing attributes take their zero value. `reset` is accepted as an
    /// alias of `reset_peer`.
    pub fn parse(type_name: &str, raw: Value) -> Result<Self> {
        let raw = match raw {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        let kind = match canonical_type(type_name) {
            Some("latency") => ToxicKind::Latency(attributes(raw)?),
            Some("bandwidth") => ToxicKind::Bandwidth(attributes(raw)?),
            Some("timeout") => ToxicKind::Timeout(attributes(raw)?),
            Some("reset_peer") => ToxicKind::ResetPeer(attributes(raw)?),
            Some("slow_close") => ToxicKind::SlowClose(attributes(raw)?),
            Some("slicer") => ToxicKind::Slicer(attributes(raw)?),
            Some("limit_data") => ToxicKind::LimitData(attributes(raw)?),
            _ => return Err(ToxicError::UnknownType(type_name.to_string())),
        };
        kind.validate()?;
        Ok(kind)
    }

    /// Returns the wire name of this type.
    pub fn type_name(&self) -> &'static str {
        match self {
            ToxicKind::Latency(_) => "latency",
            ToxicKind::Bandwidth(_) => "bandwidth",
            ToxicKind::Timeout(_) => "timeout",
            ToxicKind::ResetPeer(_) => "reset_peer",
            ToxicKind::SlowClose(_) => "slow_close",
            ToxicKind::Slicer(_) => "slicer",
            ToxicKind::LimitData(_) => "limit_data",
        }
    }

    /// Returns how often this type rolls against its toxicity.
    pub fn sampling(&self) -> Sampling {
        match self {
            ToxicKind::Latency(_) | ToxicKind::Bandwidth(_) | ToxicKind::Slicer(_) => {
                Sampling::PerChunk
            }
            ToxicKind::Timeout(_)
            | ToxicKind::ResetPeer(_)
            | ToxicKind::SlowClose(_)
            | ToxicKind::LimitData(_) => Sampling::PerConnection,
        }
    }

    /// Checks attribute combinations that deserialize but cannot run.
    pub fn validate(&self) -> Result<()> {
        if let ToxicKind::Slicer(slicer) = self {
            if slicer.average_size == 0 {
                return Err(ToxicError::InvalidAttributes(
                    "slicer average_size must be greater than 0".to_string(),
                ));
            }
            if slicer.size_variation >= slicer.average_size {
                return Err(ToxicError::InvalidAttributes(
                    "slicer size_variation must be smaller than average_size".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Returns the attributes as JSON.
    pub fn attributes(&self) -> Value {
        let value = match self {
            ToxicKind::Latency(a) => serde_json::to_value(a),
            ToxicKind::Bandwidth(a) => serde_json::to_value(a),
            ToxicKind::Timeout(a) => serde_json::to_value(a),
            ToxicKind::ResetPeer(a) => serde_json::to_value(a),
            ToxicKind::SlowClose(a) => serde_json::to_value(a),
            ToxicKind::Slicer(a) => serde_json::to_value(a),
            ToxicKind::LimitData(a) => serde_json::to_value(a),
        };
        value.unwrap_or_default()
    }
}

/// Rolls a toxicity. `1.0` always activates and `0.0` never does.
pub(crate) fn roll<R: Rng + ?Sized>(toxicity: f32, rng: &mut R) -> bool {
    if toxicity >= 1.0 {
        true
    } else if toxicity <= 0.0 {
        false
    } else {
        rng.gen::<f32>() < toxicity
    }
}

/// A named toxic attached to one direction of a proxy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Toxic {
    /// Unique name within its chain.
    pub name: String,
    /// Type and attributes.
    #[serde(flatten)]
    pub kind: ToxicKind,
    /// The direction this toxic applies to.
    pub stream: Direction,
    /// Probability (0.0 to 1.0) that the toxic activates.
    pub toxicity: f32,
    /// Attachment id assigned by the chain; 0 while detached.
    #[serde(skip)]
    pub(crate) id: u64,
}

impl Toxic {
    /// Creates a toxic that always activates.
    pub fn new(name: impl Into<String>, kind: ToxicKind, stream: Direction) -> Self {
        Self {
            name: name.into(),
            kind,
            stream,
            toxicity: 1.0,
            id: 0,
        }
    }

    /// Returns the attachment id. Each `add` to a chain gets a fresh one, so a
    /// toxic re-added under an old name is told apart from its predecessor.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Create a latency toxic.
    pub fn latency(
        name: impl Into<String>,
        latency_ms: u64,
        jitter_ms: u64,
        stream: Direction,
    ) -> Self {
        Self::new(
            name,
            ToxicKind::Latency(LatencyAttributes {
                latency: latency_ms,
                jitter: jitter_ms,
            }),
            stream,
        )
    }

    /// Create a bandwidth toxic limited to `rate_kb` KB/s.
    pub fn bandwidth(name: impl Into<String>, rate_kb: u64, stream: Direction) -> Self {
        Self::new(
            name,
            ToxicKind::Bandwidth(BandwidthAttributes { rate: rate_kb }),
            stream,
        )
    }

    /// Create a timeout toxic. A zero timeout holds the connection until removed.
    pub fn timeout(name: impl Into<String>, timeout_ms: u64, stream: Direction) -> Self {
        Self::new(
            name,
            ToxicKind::Timeout(TimeoutAttributes {
                timeout: timeout_ms,
            }),
            stream,
        )
    }

    /// Create a reset_peer toxic.
    pub fn reset_peer(name: impl Into<String>, timeout_ms: u64, stream: Direction) -> Self {
        Self::new(
            name,
            ToxicKind::ResetPeer(ResetPeerAttributes {
                timeout: timeout_ms,
            }),
            stream,
        )
    }

    /// Create a slow_close toxic.
    pub fn slow_close(name: impl Into<String>, delay_ms: u64, stream: Direction) -> Self {
        Self::new(
            name,
            ToxicKind::SlowClose(SlowCloseAttributes { delay: delay_ms }),
            stream,
        )
    }

    /// Create a slicer toxic.
    pub fn slicer(
        name: impl Into<String>,
        average_size: usize,
        size_variation: usize,
        delay_us: u64,
        stream: Direction,
    ) -> Self {
        Self::new(
            name,
            ToxicKind::Slicer(SlicerAttributes {
                average_size,
                size_variation,
                delay: delay_us,
            }),
            stream,
        )
    }

    /// Create a limit_data toxic.
    pub fn limit_data(name: impl Into<String>, bytes: u64, stream: Direction) -> Self {
        Self::new(
            name,
            ToxicKind::LimitData(LimitDataAttributes { bytes }),
            stream,
        )
    }

    /// Sets the toxicity.
    pub fn with_toxicity(mut self, toxicity: f32) -> Self {
        self.toxicity = toxicity;
        self
    }

    /// Returns the wire name of the toxic type.
    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    /// Returns how often this toxic rolls against its toxicity.
    pub fn sampling(&self) -> Sampling {
        self.kind.sampling()
    }

    /// Validates toxicity and attributes.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.toxicity) {
            return Err(ToxicError::InvalidToxicity(self.toxicity));
        }
        self.kind.validate()
    }

    /// Applies this toxic to one batch.
    ///
    /// Per-chunk toxics roll here; per-connection toxics use the decision
    /// recorded in `state`.
    pub fn transform<R: Rng + ?Sized>(
        &self,
        mut batch: Batch,
        state: &mut ToxicState,
        rng: &mut R,
    ) -> Batch {
        let active = match self.sampling() {
            Sampling::PerChunk => roll(self.toxicity, rng),
            Sampling::PerConnection => state.active,
        };
        if !active {
            return batch;
        }

        match &self.kind {
            ToxicKind::Latency(latency) => {
                let delay = latency.sample(rng);
                for segment in &mut batch.segments {
                    segment.hold += delay;
                }
                batch
            }
            ToxicKind::Bandwidth(bandwidth) => bandwidth.throttle(batch),
            ToxicKind::Slicer(slicer) => slicer.slice(batch, rng),
            ToxicKind::LimitData(limit) => limit.limit(batch, state),
            // Connection-level toxics act through `ToxicStates::effects`.
            ToxicKind::Timeout(_) | ToxicKind::ResetPeer(_) | ToxicKind::SlowClose(_) => batch,
        }
    }

    /// Returns a copy of this toxic with the patch applied.
    pub fn patched(&self, patch: &ToxicPatch) -> Result<Toxic> {
        if let Some(ref type_name) = patch.kind {
            if canonical_type(type_name) != Some(self.type_name()) {
                return Err(ToxicError::TypeChange {
                    name: self.name.clone(),
                    from: self.type_name().to_string(),
                    to: type_name.clone(),
                });
            }
        }

        let mut toxic = self.clone();
        if let Some(ref raw) = patch.attributes {
            toxic.kind = ToxicKind::parse(self.type_name(), raw.clone())?;
        }
        if let Some(toxicity) = patch.toxicity {
            toxic.toxicity = toxicity;
        }
        toxic.validate()?;
        Ok(toxic)
    }
}

/// Toxic definition as sent by API clients.
#[derive(Debug, Clone, Deserialize)]
pub struct ToxicDefinition {
    /// Name; defaults to `<type>_<stream>`.
    #[serde(default)]
    pub name: Option<String>,
    /// Type name, e.g. `latency`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Stream; must match the chain it is added to when present.
    #[serde(default)]
    pub stream: Option<String>,
    /// Toxicity; defaults to 1.0.
    #[serde(default)]
    pub toxicity: Option<f32>,
    /// Type-specific attributes.
    #[serde(default)]
    pub attributes: Value,
}

impl ToxicDefinition {
    /// The stream named in the definition, downstream when absent.
    pub fn stream(&self) -> Result<Direction> {
        match self.stream.as_deref() {
            Some(raw) => raw.parse(),
            None => Ok(Direction::Downstream),
        }
    }

    /// Resolves the definition into a toxic for the given stream.
    pub fn resolve(self, stream: Direction) -> Result<Toxic> {
        if let Some(ref requested) = self.stream {
            let requested: Direction = requested.parse()?;
            if requested != stream {
                return Err(ToxicError::WrongStream {
                    name: self.name.unwrap_or_else(|| self.kind.clone()),
                    stream: requested,
                    chain: stream,
                });
            }
        }

        let kind = ToxicKind::parse(&self.kind, self.attributes)?;
        let name = match self.name {
            Some(name) if !name.is_empty() => name,
            _ => format!("{}_{}", kind.type_name(), stream),
        };

        let toxic = Toxic {
            name,
            kind,
            stream,
            toxicity: self.toxicity.unwrap_or(1.0),
            id: 0,
        };
        toxic.validate()?;
        Ok(toxic)
    }
}

/// Update to an existing toxic. Present fields replace the current values.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToxicPatch {
    /// Type name; only accepted when equal to the current type.
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// New toxicity.
    #[serde(default)]
    pub toxicity: Option<f32>,
    /// Replacement attributes.
    #[serde(default)]
    pub attributes: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;
    use std::time::Instant;

    fn batch_of(data: impl Into<Bytes>) -> Batch {
        Batch::new(data.into())
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn state() -> ToxicState {
        ToxicState::new(true, Instant::now())
    }

    // ==================== Parsing ====================

    #[test]
    fn parse_all_types() {
        for name in [
            "latency",
            "bandwidth",
            "timeout",
            "reset_peer",
            "slow_close",
            "limit_data",
        ] {
            let kind = ToxicKind::parse(name, json!({})).unwrap();
            assert_eq!(kind.type_name(), name);
        }
        let slicer = ToxicKind::parse("slicer", json!({"average_size": 10})).unwrap();
        assert_eq!(slicer.type_name(), "slicer");
    }

    #[test]
    fn parse_reset_alias() {
        let kind = ToxicKind::parse("reset", json!({"timeout": 5})).unwrap();
        assert_eq!(kind, ToxicKind::ResetPeer(ResetPeerAttributes { timeout: 5 }));
    }

    #[test]
    fn parse_rejects_unknown_type() {
        let err = ToxicKind::parse("gremlin", json!({})).unwrap_err();
        assert!(matches!(err, ToxicError::UnknownType(ref t) if t == "gremlin"));
        assert!(err.is_invalid());
    }

    #[test]
    fn parse_rejects_bad_attributes() {
        let err = ToxicKind::parse("latency", json!({"latency": -5})).unwrap_err();
        assert!(matches!(err, ToxicError::InvalidAttributes(_)));

        let err = ToxicKind::parse("bandwidth", json!({"rate": "fast"})).unwrap_err();
        assert!(matches!(err, ToxicError::InvalidAttributes(_)));
    }

    #[test]
    fn parse_null_attributes_defaults() {
        let kind = ToxicKind::parse("latency", Value::Null).unwrap();
        assert_eq!(kind, ToxicKind::Latency(LatencyAttributes::default()));
    }

    #[test]
    fn slicer_validation() {
        assert!(ToxicKind::parse("slicer", json!({"average_size": 0})).is_err());
        assert!(ToxicKind::parse(
            "slicer",
            json!({"average_size": 10, "size_variation": 10})
        )
        .is_err());
        assert!(ToxicKind::parse(
            "slicer",
            json!({"average_size": 10, "size_variation": 9})
        )
        .is_ok());
    }

    #[test]
    fn toxicity_must_be_probability() {
        let toxic = Toxic::latency("l", 10, 0, Direction::Downstream).with_toxicity(1.5);
        assert!(matches!(
            toxic.validate(),
            Err(ToxicError::InvalidToxicity(_))
        ));
        let toxic = toxic.with_toxicity(f32::NAN);
        assert!(toxic.validate().is_err());
        let toxic = toxic.with_toxicity(0.0);
        assert!(toxic.validate().is_ok());
    }

    // ==================== Definitions ====================

    #[test]
    fn definition_defaults_name_and_toxicity() {
        let def: ToxicDefinition = serde_json::from_value(json!({
            "type": "latency",
            "attributes": {"latency": 100}
        }))
        .unwrap();
        let toxic = def.resolve(Direction::Downstream).unwrap();
        assert_eq!(toxic.name, "latency_downstream");
        assert_eq!(toxic.toxicity, 1.0);
        assert_eq!(toxic.stream, Direction::Downstream);
    }

    #[test]
    fn definition_rejects_stream_mismatch() {
        let def: ToxicDefinition = serde_json::from_value(json!({
            "name": "lag",
            "type": "latency",
            "stream": "upstream",
        }))
        .unwrap();
        let err = def.resolve(Direction::Downstream).unwrap_err();
        assert!(matches!(err, ToxicError::WrongStream { .. }));
    }

    #[test]
    fn definition_rejects_bad_stream() {
        let def: ToxicDefinition = serde_json::from_value(json!({
            "type": "latency",
            "stream": "both",
        }))
        .unwrap();
        assert!(matches!(
            def.resolve(Direction::Upstream),
            Err(ToxicError::InvalidDirection(_))
        ));
    }

    #[test]
    fn definition_stream_defaults_to_downstream() {
        let def: ToxicDefinition = serde_json::from_value(json!({"type": "latency"})).unwrap();
        assert_eq!(def.stream().unwrap(), Direction::Downstream);

        let def: ToxicDefinition =
            serde_json::from_value(json!({"type": "latency", "stream": "upstream"})).unwrap();
        assert_eq!(def.stream().unwrap(), Direction::Upstream);
    }

    #[test]
    fn toxic_serializes_wire_shape() {
        let toxic = Toxic::latency("lag", 100, 10, Direction::Upstream).with_toxicity(0.5);
        let value = serde_json::to_value(&toxic).unwrap();
        assert_eq!(value["name"], "lag");
        assert_eq!(value["type"], "latency");
        assert_eq!(value["stream"], "upstream");
        assert_eq!(value["toxicity"], 0.5);
        assert_eq!(value["attributes"]["latency"], 100);
        assert_eq!(value["attributes"]["jitter"], 10);
    }

    #[test]
    fn patch_replaces_attributes() {
        let toxic = Toxic::latency("lag", 100, 10, Direction::Upstream);
        let patch = ToxicPatch {
            attributes: Some(json!({"latency": 5})),
            ..Default::default()
        };
        let patched = toxic.patched(&patch).unwrap();
        assert_eq!(
            patched.kind,
            ToxicKind::Latency(LatencyAttributes {
                latency: 5,
                jitter: 0
            })
        );
        assert_eq!(patched.name, "lag");
    }

    #[test]
    fn patch_rejects_type_change() {
        let toxic = Toxic::latency("lag", 100, 0, Direction::Upstream);
        let patch = ToxicPatch {
            kind: Some("bandwidth".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            toxic.patched(&patch),
            Err(ToxicError::TypeChange { .. })
        ));
    }

    // ==================== Transforms ====================

    #[test]
    fn latency_holds_every_segment() {
        let toxic = Toxic::latency("lag", 100, 0, Direction::Downstream);
        let out = toxic.transform(batch_of(&b"hello"[..]), &mut state(), &mut rng());
        assert_eq!(out.to_vec(), b"hello");
        assert_eq!(out.segments[0].hold, Duration::from_millis(100));
    }

    #[test]
    fn latency_jitter_stays_in_range() {
        let attrs = LatencyAttributes {
            latency: 50,
            jitter: 20,
        };
        let mut rng = rng();
        for _ in 0..200 {
            let d = attrs.sample(&mut rng);
            assert!(d >= Duration::from_millis(30) && d <= Duration::from_millis(70));
        }
    }

    #[test]
    fn latency_jitter_never_negative() {
        let attrs = LatencyAttributes {
            latency: 0,
            jitter: 50,
        };
        let mut rng = rng();
        for _ in 0..100 {
            assert!(attrs.sample(&mut rng) <= Duration::from_millis(50));
        }
    }

    #[test]
    fn bandwidth_paces_by_rate() {
        // 10 KB/s: 1000 bytes take 100ms.
        let toxic = Toxic::bandwidth("bw", 10, Direction::Downstream);
        let out = toxic.transform(batch_of(vec![0u8; 1000]), &mut state(), &mut rng());
        assert_eq!(out.segments.len(), 1);
        assert_eq!(out.total_pause(), Duration::from_millis(100));
    }

    #[test]
    fn bandwidth_splits_large_chunks() {
        // 1 KB/s: pieces of 100 bytes, 100ms each.
        let toxic = Toxic::bandwidth("bw", 1, Direction::Downstream);
        let data: Vec<u8> = (0..=255).collect();
        let out = toxic.transform(batch_of(data.clone()), &mut state(), &mut rng());
        assert_eq!(out.segments.len(), 3);
        assert_eq!(out.to_vec(), data);
        assert_eq!(out.segments[0].pause, Duration::from_millis(100));
        assert_eq!(out.total_pause(), Duration::from_millis(256));
    }

    #[test]
    fn bandwidth_zero_is_unlimited() {
        let toxic = Toxic::bandwidth("bw", 0, Direction::Downstream);
        let out = toxic.transform(batch_of(vec![1u8; 5000]), &mut state(), &mut rng());
        assert_eq!(out.total_pause(), Duration::ZERO);
    }

    #[test]
    fn slicer_preserves_bytes() {
        let toxic = Toxic::slicer("s", 10, 5, 1000, Direction::Upstream);
        let data: Vec<u8> = (0..200u8).collect();
        let out = toxic.transform(batch_of(data.clone()), &mut state(), &mut rng());
        assert_eq!(out.to_vec(), data);
        assert!(out.segments.len() >= 200 / 15);
        assert!(out.segments.iter().all(|s| s.len() <= 15));
        assert_eq!(out.segments[0].pause, Duration::ZERO);
        assert!(out.segments[1..]
            .iter()
            .all(|s| s.pause == Duration::from_micros(1000)));
    }

    #[test]
    fn limit_data_truncates_and_closes() {
        let toxic = Toxic::limit_data("cap", 8, Direction::Downstream);
        let mut st = state();
        let out = toxic.transform(batch_of(&b"hello"[..]), &mut st, &mut rng());
        assert_eq!(out.to_vec(), b"hello");
        assert!(!out.close);

        let out = toxic.transform(batch_of(&b"world"[..]), &mut st, &mut rng());
        assert_eq!(out.to_vec(), b"wor");
        assert!(out.close);
        assert_eq!(st.passed, 8);
    }

    #[test]
    fn inactive_connection_toxic_passes_through() {
        let toxic = Toxic::limit_data("cap", 1, Direction::Downstream);
        let mut st = ToxicState::new(false, Instant::now());
        let out = toxic.transform(batch_of(&b"hello"[..]), &mut st, &mut rng());
        assert_eq!(out.to_vec(), b"hello");
        assert!(!out.close);
    }

    #[test]
    fn zero_toxicity_never_activates() {
        let toxic = Toxic::latency("lag", 100, 0, Direction::Downstream).with_toxicity(0.0);
        let mut rng = rng();
        for _ in 0..100 {
            let out = toxic.transform(batch_of(&b"x"[..]), &mut state(), &mut rng);
            assert_eq!(out.segments[0].hold, Duration::ZERO);
        }
    }

    #[test]
    fn partial_toxicity_activates_sometimes() {
        let toxic = Toxic::latency("lag", 100, 0, Direction::Downstream).with_toxicity(0.5);
        let mut rng = rng();
        let hits = (0..1000)
            .filter(|_| {
                let out = toxic.transform(batch_of(&b"x"[..]), &mut state(), &mut rng);
                out.segments[0].hold > Duration::ZERO
            })
            .count();
        assert!(hits > 350 && hits < 650, "hits = {hits}");
    }
}
