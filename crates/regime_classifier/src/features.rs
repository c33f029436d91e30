//! Typed feature view the rule table evaluates against.

use chrono::Weekday;
use common::config::RegimeConfig;
use common::{
    Error, MarketContextFeatures, RegimeType, Result, TradingSession, VolumeProfileFeatures,
};

#[derive(Debug, Clone, PartialEq)]
pub struct RegimeFeatures {
    pub zero_dte_share: f64,
    pub put_call_ratio: f64,
    pub gamma_concentration: f64,
    /// Fraction of instruments whose value area is narrower than the tight threshold.
    pub tight_value_area_frac: f64,
    /// Fraction of instruments whose value area is wider than the wide threshold.
    pub wide_value_area_frac: f64,
    pub avg_value_area_pct: f64,
    pub avg_imbalance: f64,
    /// Mean high-volume nodes per instrument.
    pub hvn_density: f64,
    /// Mean low-volume nodes per instrument.
    pub lvn_density: f64,
    pub instruments: usize,
    pub is_friday: bool,
    pub session: TradingSession,
    pub hour: u32,
    pub hint: Option<RegimeType>,
}

impl RegimeFeatures {
    /// Validates the raw bundles and reduces them to rule inputs.
    pub fn derive(
        context: &MarketContextFeatures,
        profiles: &[VolumeProfileFeatures],
        config: &RegimeConfig,
    ) -> Result<Self> {
        validate_context(context)?;
        if profiles.is_empty() {
            return Err(Error::InvalidInput("no volume profiles supplied".into()));
        }
        for p in profiles {
            validate_profile(p)?;
        }

        let n = profiles.len() as f64;
        let widths: Vec<f64> = profiles.iter().map(|p| p.value_area_width_pct()).collect();
        let tight = widths
            .iter()
            .filter(|w| **w <= config.tight_value_area_pct)
            .count();
        let wide = widths
            .iter()
            .filter(|w| **w >= config.wide_value_area_pct)
            .count();

        Ok(Self {
            zero_dte_share: context.spx_0dte_share,
            put_call_ratio: context.put_call_ratio,
            gamma_concentration: context.gamma_concentration,
            tight_value_area_frac: tight as f64 / n,
            wide_value_area_frac: wide as f64 / n,
            avg_value_area_pct: widths.iter().sum::<f64>() / n,
            avg_imbalance: profiles.iter().map(|p| p.imbalance()).sum::<f64>() / n,
            hvn_density: profiles
                .iter()
                .map(|p| p.high_volume_nodes.len() as f64)
                .sum::<f64>()
                / n,
            lvn_density: profiles
                .iter()
                .map(|p| p.low_volume_nodes.len() as f64)
                .sum::<f64>()
                / n,
            instruments: profiles.len(),
            is_friday: context.weekday == Weekday::Fri,
            session: context.session,
            hour: context.hour,
            hint: context.regime_hint.as_deref().and_then(parse_hint),
        })
    }
}

fn parse_hint(raw: &str) -> Option<RegimeType> {
    RegimeType::parse(raw).or_else(|| match raw.trim().to_ascii_lowercase().as_str() {
        "trend" | "trending" => Some(RegimeType::StrongTrend),
        "range" | "ranging" | "choppy" => Some(RegimeType::MeanReversion),
        "pinned" | "pin" => Some(RegimeType::Pinning),
        "volatile" | "high_vol" => Some(RegimeType::HighVolatility),
        "gamma" | "squeeze" => Some(RegimeType::GammaSqueeze),
        _ => None,
    })
}

fn validate_context(c: &MarketContextFeatures) -> Result<()> {
    let unit = |name: &str, v: f64| {
        if v.is_finite() && (0.0..=1.0).contains(&v) {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!("{name} out of range: {v}")))
        }
    };
    unit("spx_0dte_share", c.spx_0dte_share)?;
    unit("gamma_concentration", c.gamma_concentration)?;
    if !c.put_call_ratio.is_finite() || c.put_call_ratio < 0.0 {
        return Err(Error::InvalidInput(format!(
            "put_call_ratio out of range: {}",
            c.put_call_ratio
        )));
    }
    if c.hour > 23 {
        return Err(Error::InvalidInput(format!("hour out of range: {}", c.hour)));
    }
    Ok(())
}

fn validate_profile(p: &VolumeProfileFeatures) -> Result<()> {
    let prices = [p.point_of_control, p.value_area_high, p.value_area_low];
    if prices.iter().any(|v| !v.is_finite()) || p.point_of_control <= 0.0 {
        return Err(Error::InvalidInput(format!(
            "{}: malformed volume profile prices",
            p.instrument
        )));
    }
    if p.value_area_high < p.value_area_low {
        return Err(Error::InvalidInput(format!(
            "{}: value area high below value area low",
            p.instrument
        )));
    }
    if !p.total_volume.is_finite() || p.total_volume < 0.0 {
        return Err(Error::InvalidInput(format!(
            "{}: negative total volume",
            p.instrument
        )));
    }
    Ok(())
}
