use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::{Path, PathBuf};

pub const COUNTRIES: [&str; 6] = ["Brazil", "France", "Germany", "India", "Japan", "Kenya"];
pub const FIRST_YEAR: i64 = 2000;
pub const LAST_YEAR: i64 = 2022;

/// The one observation whose imports cell is left empty.
pub const GAP: (&str, i64) = ("France", 2010);

const HEADER: &str = "Country,Year,GDP_Growth_Rate,Population_Growth_Rate,\
Exports of goods and services_Growth_Rate,Imports of goods and services_Growth_Rate,\
Gross capital formation_Growth_Rate,Final consumption expenditure_Growth_Rate,\
Government_Expenditure_Growth_Rate";

pub fn observation_count() -> usize {
    COUNTRIES.len() * (LAST_YEAR - FIRST_YEAR + 1) as usize
}

/// Writes a synthetic panel where each country's growth follows its own
/// previous-year exports and investment plus a per-country offset. Rows are
/// written year by year so the loader has to restore entity order.
pub fn write_dataset(dir: &Path) -> PathBuf {
    let mut rng = StdRng::seed_from_u64(7);
    let n_indicators = 6;
    let mut previous: Vec<Vec<f64>> = COUNTRIES
        .iter()
        .map(|_| (0..n_indicators).map(|_| rng.gen_range(-5.0..10.0)).collect())
        .collect();

    let mut csv = String::from(HEADER);
    csv.push('\n');
    for year in FIRST_YEAR..=LAST_YEAR {
        for (c, country) in COUNTRIES.iter().enumerate() {
            let lagged = &previous[c];
            let growth = 0.5 * lagged[1] + 0.3 * lagged[3] + c as f64 - 2.0
                + rng.gen_range(-0.3..0.3);
            let current: Vec<f64> = (0..n_indicators)
                .map(|_| rng.gen_range(-5.0..10.0))
                .collect();

            let cells: Vec<String> = current
                .iter()
                .enumerate()
                .map(|(j, v)| {
                    if (*country, year) == GAP && j == 2 {
                        String::new()
                    } else {
                        format!("{v:.4}")
                    }
                })
                .collect();
            csv.push_str(&format!("{country},{year},{growth:.4},{}\n", cells.join(",")));
            previous[c] = current;
        }
    }

    let path = dir.join("gdp.csv");
    fs::write(&path, csv).expect("Failed to write dataset");
    path
}
