use std::fmt::Write;

use super::Alert;

/// Format styles supported when rendering alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertFormat {
    Human,
    Json,
}

/// Produce the message body for an alert in the desired format.
pub fn render_alert(alert: &Alert, format: AlertFormat) -> anyhow::Result<String> {
    match format {
        AlertFormat::Human => render_human(alert),
        AlertFormat::Json => Ok(serde_json::to_string_pretty(alert)?),
    }
}

fn render_human(alert: &Alert) -> anyhow::Result<String> {
    let mut out = String::new();
    writeln!(out, "POTENTIAL VULNERABILITY FOUND")?;
    writeln!(out)?;
    writeln!(out, "Contract:   {}", alert.contract)?;
    writeln!(out, "Chain:      {}", alert.chain)?;
    writeln!(out, "Type:       {}", alert.vulnerability_kind)?;
    writeln!(out, "Confidence: {:.0}%", alert.confidence * 100.0)?;
    if let Some(bounty) = alert.bounty {
        if bounty.min_usd == bounty.max_usd {
            writeln!(out, "Bounty:     {}", format_usd(bounty.max_usd))?;
        } else {
            writeln!(
                out,
                "Bounty:     {} - {}",
                format_usd(bounty.min_usd),
                format_usd(bounty.max_usd)
            )?;
        }
    }
    writeln!(out, "Reference:  {}", alert.reference)?;
    writeln!(out)?;
    write!(out, "Manual review required before submission.")?;
    Ok(out)
}

/// `$1,250,000`-style rendering of a whole-dollar amount.
pub fn format_usd(amount: u64) -> String {
    let digits = amount.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    format!("${grouped}")
}

/// Block explorer page for a contract; unknown chains fall back to Etherscan.
pub fn explorer_url(chain: &str, address: &str) -> String {
    let base = match chain.to_ascii_lowercase().as_str() {
        "base" => "https://basescan.org",
        "arbitrum" => "https://arbiscan.io",
        "optimism" => "https://optimistic.etherscan.io",
        "bsc" | "bnb" => "https://bscscan.com",
        _ => "https://etherscan.io",
    };
    format!("{base}/address/{address}")
}
