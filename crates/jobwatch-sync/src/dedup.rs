use std::collections::HashMap;

use jobwatch_core::JobRecord;

/// Stable dedup pass: the first record for each dedup key survives, later
/// duplicates are dropped. The survivor absorbs the search terms of the
/// records it replaces; nothing else about it changes.
pub fn dedup_jobs(jobs: Vec<JobRecord>) -> Vec<JobRecord> {
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(jobs.len());
    let mut out: Vec<JobRecord> = Vec::with_capacity(jobs.len());
    for job in jobs {
        match positions.get(job.dedup_key()) {
            Some(&idx) => {
                let terms = job.search_terms_matched;
                out[idx].search_terms_matched.extend(terms);
            }
            None => {
                positions.insert(job.dedup_key().to_string(), out.len());
                out.push(job);
            }
        }
    }
    out
}
