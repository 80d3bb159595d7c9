//! Dice formulas and signed roll evidence
//!
//! Every roll produces an evidence record signed with the roller's identity
//! key, so any peer holding the event can audit authenticity without
//! trusting the relay path. Verification runs at materialization time.

use crate::crypto;
use crate::error::{CoreError, Result};
use crate::identity::Identity;
use crate::types::now_millis;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// Permitted formula bounds; in-grammar values outside these ranges are
/// rejected with `FormulaOutOfRange`.
pub const MAX_DICE_COUNT: u32 = 100;
pub const MAX_DICE_SIDES: u32 = 1000;
pub const MAX_MODIFIER: i32 = 1000;

/// Roll mode
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollMode {
    Normal,
    Advantage,
    Disadvantage,
}

/// A parsed dice formula: `NdM`, `NdM+K`, or `NdM-K`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiceFormula {
    pub count: u32,
    pub sides: u32,
    pub modifier: i32,
}

impl DiceFormula {
    /// Parse a formula like `2d6+3`. Case-insensitive `d`, optional
    /// modifier. Grammar errors are `FormulaInvalid`; out-of-bounds values
    /// are `FormulaOutOfRange`.
    pub fn parse(input: &str) -> Result<Self> {
        let text = input.trim();
        let invalid = || CoreError::FormulaInvalid(input.to_string());

        let d_pos = text.find(['d', 'D']).ok_or_else(invalid)?;
        let (count_str, rest) = text.split_at(d_pos);
        let rest = &rest[1..];

        let (sides_str, modifier) = match rest.find(['+', '-']) {
            Some(pos) => {
                let (sides, tail) = rest.split_at(pos);
                let sign = if tail.starts_with('-') { -1i64 } else { 1i64 };
                let magnitude: i64 = tail[1..].parse().map_err(|_| invalid())?;
                (sides, sign * magnitude)
            }
            None => (rest, 0),
        };

        let count: u64 = if count_str.is_empty() {
            1
        } else {
            count_str.parse().map_err(|_| invalid())?
        };
        let sides: u64 = sides_str.parse().map_err(|_| invalid())?;

        if count == 0 || sides < 2 {
            return Err(invalid());
        }
        if count > u64::from(MAX_DICE_COUNT)
            || sides > u64::from(MAX_DICE_SIDES)
            || modifier.unsigned_abs() > MAX_MODIFIER as u64
        {
            return Err(CoreError::FormulaOutOfRange(input.to_string()));
        }

        Ok(Self {
            count: count as u32,
            sides: sides as u32,
            modifier: modifier as i32,
        })
    }

    /// Canonical rendering; `parse(render(f)) == f`
    pub fn render(&self) -> String {
        match self.modifier {
            0 => format!("{}d{}", self.count, self.sides),
            m if m > 0 => format!("{}d{}+{}", self.count, self.sides, m),
            m => format!("{}d{}{}", self.count, self.sides, m),
        }
    }
}

impl std::fmt::Display for DiceFormula {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

/// One physical die result; `kept` marks whether it counts toward the total
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DieComponent {
    pub value: u32,
    pub kept: bool,
}

/// Signed record of a roll.
///
/// The Ed25519 signature in [`crate::types::DiceRollBody`] covers the
/// canonical JSON serialization of this struct, so field order is
/// wire-stable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiceEvidence {
    pub roll_id: Uuid,
    pub peer_id: String,
    pub device_name: String,
    /// Base64 of the roller's Ed25519 identity public key
    pub identity_public_key: String,
    pub dice_count: u32,
    pub dice_sides: u32,
    pub modifier: i32,
    pub mode: RollMode,
    pub components: Vec<DieComponent>,
    pub total: i64,
    pub formula: String,
    pub rolled_at: DateTime<Utc>,
}

/// Canonical byte form of evidence for signing and verification
pub fn evidence_canonical_bytes(evidence: &DiceEvidence) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(evidence)?)
}

/// Roll dice for a formula.
///
/// Under advantage or disadvantage every die in the pool is rolled twice
/// and the higher (or lower) result is kept; both component rolls stay in
/// the evidence so verifiers can audit the keep rule.
pub fn roll(formula: &DiceFormula, mode: RollMode) -> (Vec<DieComponent>, i64) {
    let mut rng = rand::thread_rng();
    let mut components = Vec::new();
    let mut total: i64 = 0;

    for _ in 0..formula.count {
        match mode {
            RollMode::Normal => {
                let value = rng.gen_range(1..=formula.sides);
                components.push(DieComponent { value, kept: true });
                total += i64::from(value);
            }
            RollMode::Advantage | RollMode::Disadvantage => {
                let first = rng.gen_range(1..=formula.sides);
                let second = rng.gen_range(1..=formula.sides);
                let keep_first = match mode {
                    RollMode::Advantage => first >= second,
                    _ => first <= second,
                };
                components.push(DieComponent {
                    value: first,
                    kept: keep_first,
                });
                components.push(DieComponent {
                    value: second,
                    kept: !keep_first,
                });
                total += i64::from(if keep_first { first } else { second });
            }
        }
    }

    (components, total + i64::from(formula.modifier))
}

/// Parse, roll, and sign in one step, producing a ready-to-append payload
pub fn build_signed_roll(
    identity: &Identity,
    formula_text: &str,
    mode: RollMode,
) -> Result<crate::types::DiceRollBody> {
    let formula = DiceFormula::parse(formula_text)?;
    let (components, total) = roll(&formula, mode);

    let evidence = DiceEvidence {
        roll_id: Uuid::new_v4(),
        peer_id: identity.peer_id().to_string(),
        device_name: identity.device_name().to_string(),
        identity_public_key: B64.encode(identity.identity_public_key()),
        dice_count: formula.count,
        dice_sides: formula.sides,
        modifier: formula.modifier,
        mode,
        components,
        total,
        formula: formula.render(),
        rolled_at: now_millis(),
    };

    let signature = identity.sign(&evidence_canonical_bytes(&evidence)?);
    Ok(crate::types::DiceRollBody {
        evidence,
        signature: B64.encode(signature),
    })
}

/// Verify a roll's signature against the identity key embedded in its
/// evidence. Any parse or verify failure yields false with a warning; the
/// roll stays in history either way.
pub fn verify_roll(body: &crate::types::DiceRollBody) -> bool {
    let Ok(public_key) = B64.decode(&body.evidence.identity_public_key) else {
        warn!(roll_id = %body.evidence.roll_id, "undecodable identity key in dice evidence");
        return false;
    };
    let Ok(signature) = B64.decode(&body.signature) else {
        warn!(roll_id = %body.evidence.roll_id, "undecodable dice signature");
        return false;
    };
    let Ok(canonical) = evidence_canonical_bytes(&body.evidence) else {
        return false;
    };
    crypto::verify(&public_key, &canonical, &signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{IdentityManager, MemorySecureStore};
    use std::sync::Arc;

    async fn test_identity() -> Arc<Identity> {
        IdentityManager::new(Arc::new(MemorySecureStore::new()), Some("Roller".into()))
            .initialize()
            .await
            .unwrap()
    }

    #[test]
    fn test_parse_plain() {
        let f = DiceFormula::parse("2d6").unwrap();
        assert_eq!((f.count, f.sides, f.modifier), (2, 6, 0));
    }

    #[test]
    fn test_parse_with_modifier() {
        let f = DiceFormula::parse("1d20+5").unwrap();
        assert_eq!((f.count, f.sides, f.modifier), (1, 20, 5));
        let f = DiceFormula::parse("4d8-2").unwrap();
        assert_eq!((f.count, f.sides, f.modifier), (4, 8, -2));
    }

    #[test]
    fn test_parse_implicit_count() {
        let f = DiceFormula::parse("d12").unwrap();
        assert_eq!((f.count, f.sides), (1, 12));
    }

    #[test]
    fn test_parse_invalid() {
        for input in ["", "banana", "2x6", "0d6", "2d1", "2d", "d", "2d6+"] {
            assert!(
                matches!(DiceFormula::parse(input), Err(CoreError::FormulaInvalid(_))),
                "expected FormulaInvalid for {input:?}"
            );
        }
    }

    #[test]
    fn test_parse_out_of_range() {
        for input in ["101d6", "1d1001", "1d6+1001", "1d6-1001"] {
            assert!(
                matches!(
                    DiceFormula::parse(input),
                    Err(CoreError::FormulaOutOfRange(_))
                ),
                "expected FormulaOutOfRange for {input:?}"
            );
        }
    }

    #[test]
    fn test_render_roundtrip() {
        for text in ["2d6", "1d20+5", "4d8-2"] {
            let f = DiceFormula::parse(text).unwrap();
            assert_eq!(f.render(), text);
            assert_eq!(DiceFormula::parse(&f.render()).unwrap(), f);
        }
    }

    #[test]
    fn test_roll_normal_bounds() {
        let formula = DiceFormula::parse("10d6+2").unwrap();
        let (components, total) = roll(&formula, RollMode::Normal);
        assert_eq!(components.len(), 10);
        assert!(components.iter().all(|c| c.kept && (1..=6).contains(&c.value)));
        let sum: i64 = components.iter().map(|c| i64::from(c.value)).sum();
        assert_eq!(total, sum + 2);
    }

    #[test]
    fn test_roll_advantage_keeps_higher() {
        let formula = DiceFormula::parse("1d20").unwrap();
        for _ in 0..50 {
            let (components, total) = roll(&formula, RollMode::Advantage);
            assert_eq!(components.len(), 2);
            let kept: Vec<_> = components.iter().filter(|c| c.kept).collect();
            assert_eq!(kept.len(), 1);
            let max = components.iter().map(|c| c.value).max().unwrap();
            assert_eq!(kept[0].value, max);
            assert_eq!(total, i64::from(max));
        }
    }

    #[test]
    fn test_roll_disadvantage_keeps_lower() {
        let formula = DiceFormula::parse("1d20").unwrap();
        for _ in 0..50 {
            let (components, _) = roll(&formula, RollMode::Disadvantage);
            let kept = components.iter().find(|c| c.kept).unwrap();
            let min = components.iter().map(|c| c.value).min().unwrap();
            assert_eq!(kept.value, min);
        }
    }

    #[tokio::test]
    async fn test_signed_roll_verifies() {
        let identity = test_identity().await;
        let body = build_signed_roll(&identity, "2d6+1", RollMode::Normal).unwrap();
        assert!(verify_roll(&body));
    }

    #[tokio::test]
    async fn test_tampered_evidence_fails() {
        let identity = test_identity().await;
        let mut body = build_signed_roll(&identity, "2d6+1", RollMode::Normal).unwrap();
        body.evidence.total += 1;
        assert!(!verify_roll(&body));
    }

    #[tokio::test]
    async fn test_garbage_key_fails_without_panic() {
        let identity = test_identity().await;
        let mut body = build_signed_roll(&identity, "1d4", RollMode::Normal).unwrap();
        body.evidence.identity_public_key = "!!!".into();
        assert!(!verify_roll(&body));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_render_parse_roundtrip(
                count in 1u32..=MAX_DICE_COUNT,
                sides in 2u32..=MAX_DICE_SIDES,
                modifier in -(MAX_MODIFIER)..=MAX_MODIFIER,
            ) {
                let formula = DiceFormula { count, sides, modifier };
                prop_assert_eq!(DiceFormula::parse(&formula.render()).unwrap(), formula);
            }

            #[test]
            fn prop_roll_total_matches_kept_components(
                count in 1u32..=20,
                sides in 2u32..=100,
                modifier in -50i32..=50,
                advantage in any::<bool>(),
            ) {
                let formula = DiceFormula { count, sides, modifier };
                let mode = if advantage { RollMode::Advantage } else { RollMode::Disadvantage };
                let (components, total) = roll(&formula, mode);

                prop_assert_eq!(components.len(), count as usize * 2);
                let kept: i64 = components
                    .iter()
                    .filter(|c| c.kept)
                    .map(|c| i64::from(c.value))
                    .sum();
                prop_assert_eq!(total, kept + i64::from(modifier));
                prop_assert!(components.iter().all(|c| (1..=sides).contains(&c.value)));
            }
        }
    }
}
