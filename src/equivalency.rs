use serde::Serialize;

/// Grams of CO2e per unit for everyday activities.
const FACTORS: [(&str, f64, &str, &str); 6] = [
    ("miles_driven", 400.0, "miles", "Miles driven in an average passenger car"),
    ("trees_year", 21_772.0, "trees", "Trees growing for a year to absorb it"),
    ("trees_day", 59.6, "tree-days", "Tree-days of carbon sequestration"),
    ("smartphone_charges", 8.22, "charges", "Full smartphone battery charges"),
    ("kettles_boiled", 70.0, "litres", "Litres of water boiled in an electric kettle"),
    ("streaming_hours", 55.0, "hours", "Hours of HD video streaming"),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Equivalency {
    pub key: &'static str,
    pub value: f64,
    pub unit: &'static str,
    pub description: &'static str,
}

/// Expresses `grams` of CO2e as everyday equivalents. Zero, negative or
/// non-finite input yields nothing.
pub fn equivalencies(grams: f64) -> Vec<Equivalency> {
    if !grams.is_finite() || grams <= 0.0 {
        return Vec::new();
    }
    FACTORS
        .iter()
        .map(|&(key, per_unit, unit, description)| Equivalency {
            key,
            value: grams / per_unit,
            unit,
            description,
        })
        .collect()
}
