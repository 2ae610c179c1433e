use tabled::Tabled;

#[derive(Tabled)]
pub struct ActionRow {
    pub scenario: String,
    pub action: String,
    #[tabled(display = "float3")]
    pub min_s: f64,
    #[tabled(display = "float3")]
    pub median_s: f64,
    #[tabled(display = "float3")]
    pub p90_s: f64,
    #[tabled(display = "float3")]
    pub p95_s: f64,
    #[tabled(display = "float3")]
    pub max_s: f64,
    #[tabled(display = "float3")]
    pub avg_s: f64,
    #[tabled(display = "percent")]
    pub success: f64,
    pub count: usize,
}

#[derive(Debug, Tabled)]
pub struct SlaRow {
    pub workload: usize,
    pub scenario: String,
    pub criterion: String,
    pub status: String,
    pub detail: String,
}

fn float3(n: &f64) -> String {
    format!("{:.3}", n)
}

fn percent(n: &f64) -> String {
    format!("{:.1}%", n)
}
