use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Local};

use crate::decode::ProcessRecord;

/// PIDs listed per row in the tabular report before the remainder is summarized.
const REPORT_PID_LIMIT: usize = 5;

/// Per-name statistics for one sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedStat {
    pub name: String,
    pub total_count: u64,
    /// Number of map entries that contributed.
    pub executions: usize,
    /// Contributing pids in iteration order.
    pub pids: Vec<u32>,
}

/// Group records by process name.
///
/// The result holds one stat per distinct name, ordered by `total_count` descending. Names
/// with equal totals keep the order in which they were first seen.
pub fn aggregate<I>(records: I) -> Vec<AggregatedStat>
where
    I: IntoIterator<Item = ProcessRecord>,
{
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut stats: Vec<AggregatedStat> = Vec::new();

    for record in records {
        let i = match index.get(&record.name) {
            Some(&i) => i,
            None => {
                let i = stats.len();
                index.insert(record.name.clone(), i);
                stats.push(AggregatedStat {
                    name: record.name,
                    total_count: 0,
                    executions: 0,
                    pids: Vec::new(),
                });
                i
            }
        };
        let slot = &mut stats[i];
        slot.total_count = slot.total_count.saturating_add(record.count);
        slot.executions += 1;
        slot.pids.push(record.pid);
    }

    // `sort_by` is stable, which keeps first-seen order among ties.
    stats.sort_by(|a, b| b.total_count.cmp(&a.total_count));
    stats
}

/// Aggregated sample with the time it was taken.
#[derive(Debug, Clone)]
pub struct Report {
    pub taken_at: DateTime<Local>,
    pub stats: Vec<AggregatedStat>,
}

impl Report {
    pub fn new(stats: Vec<AggregatedStat>) -> Self {
        Self {
            taken_at: Local::now(),
            stats,
        }
    }

    pub fn total(&self) -> u64 {
        self.stats
            .iter()
            .fold(0u64, |acc, s| acc.saturating_add(s.total_count))
    }
}

fn format_pids(pids: &[u32]) -> String {
    let shown: Vec<String> = pids
        .iter()
        .take(REPORT_PID_LIMIT)
        .map(u32::to_string)
        .collect();
    let mut out = shown.join(", ");
    if pids.len() > REPORT_PID_LIMIT {
        out.push_str(&format!(" ... and {} more", pids.len() - REPORT_PID_LIMIT));
    }
    out
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "[{}] {} process names, {} execve calls",
            self.taken_at.format("%Y-%m-%d %H:%M:%S"),
            self.stats.len(),
            self.total()
        )?;
        writeln!(f, "{:<16} {:>12} {:>8}  {}", "COMM", "TOTAL", "EXECS", "PIDS")?;
        for stat in &self.stats {
            writeln!(
                f,
                "{:<16} {:>12} {:>8}  {}",
                stat.name,
                stat.total_count,
                stat.executions,
                format_pids(&stat.pids)
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(name: &str, pid: u32, count: u64) -> ProcessRecord {
        ProcessRecord::new(name, pid, count)
    }

    #[test]
    fn test_same_name_merges() {
        let stats = aggregate(vec![rec("bash", 100, 5), rec("bash", 101, 3)]);
        assert_eq!(
            stats,
            vec![AggregatedStat {
                name: "bash".to_string(),
                total_count: 8,
                executions: 2,
                pids: vec![100, 101],
            }]
        );
    }

    #[test]
    fn test_empty_input() {
        assert!(aggregate(Vec::new()).is_empty());
    }

    #[test]
    fn test_sorted_descending_by_total() {
        let stats = aggregate(vec![
            rec("ls", 1, 2),
            rec("cc", 2, 40),
            rec("sh", 3, 7),
            rec("ls", 4, 1),
        ]);
        let order: Vec<(&str, u64)> = stats
            .iter()
            .map(|s| (s.name.as_str(), s.total_count))
            .collect();
        assert_eq!(order, vec![("cc", 40), ("sh", 7), ("ls", 3)]);
    }

    #[test]
    fn test_ties_keep_first_seen_order() {
        let stats = aggregate(vec![
            rec("zsh", 1, 4),
            rec("awk", 2, 9),
            rec("cat", 3, 4),
            rec("bash", 4, 4),
        ]);
        let names: Vec<&str> = stats.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["awk", "zsh", "cat", "bash"]);
    }

    #[test]
    fn test_zero_counts_are_kept() {
        let stats = aggregate(vec![rec("idle", 1, 0), rec("idle", 2, 0)]);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].total_count, 0);
        assert_eq!(stats[0].executions, 2);
    }

    #[test]
    fn test_covers_every_name_and_preserves_sum() {
        let names = ["a", "b", "c", "d", "e"];
        let records: Vec<ProcessRecord> = (0..50u32)
            .map(|i| rec(names[(i * 7 % 5) as usize], i, u64::from(i * 13 % 11)))
            .collect();
        let input_sum: u64 = records.iter().map(|r| r.count).sum();

        let stats = aggregate(records.clone());

        let mut seen: Vec<&str> = stats.iter().map(|s| s.name.as_str()).collect();
        seen.sort_unstable();
        assert_eq!(seen, names.to_vec());
        assert_eq!(stats.iter().map(|s| s.total_count).sum::<u64>(), input_sum);
        assert_eq!(
            stats.iter().map(|s| s.executions).sum::<usize>(),
            records.len()
        );
        assert!(stats.windows(2).all(|w| w[0].total_count >= w[1].total_count));
    }

    #[test]
    fn test_saturating_total() {
        let stats = aggregate(vec![rec("x", 1, u64::MAX), rec("x", 2, 10)]);
        assert_eq!(stats[0].total_count, u64::MAX);
    }

    #[test]
    fn test_report_truncates_pid_list() {
        let records = (100..106).map(|pid| rec("make", pid, 1));
        let report = Report::new(aggregate(records));
        let text = report.to_string();
        let row = text.lines().find(|l| l.starts_with("make")).unwrap();
        assert!(row.ends_with("100, 101, 102, 103, 104 ... and 1 more"), "{row}");
        assert!(!row.contains("105"));
    }

    #[test]
    fn test_report_short_pid_list() {
        assert_eq!(format_pids(&[1, 2, 3]), "1, 2, 3");
        assert_eq!(format_pids(&[1, 2, 3, 4, 5]), "1, 2, 3, 4, 5");
        assert_eq!(format_pids(&[]), "");
    }

    #[test]
    fn test_report_header_and_total() {
        let report = Report::new(aggregate(vec![rec("bash", 1, 5), rec("sh", 2, 3)]));
        assert_eq!(report.total(), 8);
        let text = report.to_string();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().ends_with("2 process names, 8 execve calls"));
        assert!(lines.next().unwrap().starts_with("COMM"));
        assert!(lines.next().unwrap().starts_with("bash"));
    }
}
