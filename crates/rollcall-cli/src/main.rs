use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::enroll::name_from_filename;
use rollcall_core::{AttendanceRow, Student};
use rollcall_db::{import_roster, AttendanceDb, ImportDefaults};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Batches of classroom photos can take a while on CPU inference.
const METHOD_TIMEOUT: Duration = Duration::from_secs(300);

// `#[zbus::proxy]` generates `AttendanceProxy` for the daemon's interface.
#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn enroll_student(&self, student_json: &str, image: &[u8]) -> zbus::Result<String>;
    async fn add_sample(&self, name: &str, image: &[u8]) -> zbus::Result<String>;
    async fn encode_faces(&self, name: &str, images: &[Vec<u8>]) -> zbus::Result<String>;
    async fn mark_attendance(
        &self,
        images: &[Vec<u8>],
        lecture: &str,
        section: &str,
    ) -> zbus::Result<(String, Vec<Vec<u8>>)>;
    async fn attendance_rows(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
    async fn reload_store(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-match attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new student with a face photo
    Enroll {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "B.Tech")]
        program: String,
        #[arg(long, default_value = "CSE")]
        branch: String,
        #[arg(long, default_value = "")]
        mobile: String,
        #[arg(long, default_value = "")]
        email: String,
        /// Photo containing the student's face
        photo: PathBuf,
    },
    /// Add another face photo for an enrolled student
    AddSample {
        #[arg(long)]
        name: String,
        photo: PathBuf,
    },
    /// Mark attendance from one or more classroom photos
    Mark {
        #[arg(required = true)]
        images: Vec<PathBuf>,
        #[arg(short, long, default_value = "")]
        lecture: String,
        #[arg(short, long, default_value = "")]
        section: String,
        /// Write annotated copies of the photos here
        #[arg(long)]
        out_dir: Option<PathBuf>,
        /// Print the raw JSON report
        #[arg(long)]
        json: bool,
    },
    /// Show every recorded attendance row
    Attendance {
        #[arg(long)]
        json: bool,
    },
    /// Show daemon status
    Status,
    /// Make the daemon re-read its embedding store file
    ReloadStore,
    /// Import students from a registration-form CSV export
    ImportRoster {
        csv: PathBuf,
        #[arg(long, default_value = rollcall_db::import::DEFAULT_PROGRAM)]
        program: String,
        #[arg(long, default_value = rollcall_db::import::DEFAULT_BRANCH)]
        branch: String,
        /// Database to write (defaults to the daemon's)
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Enroll every `Name-N.jpg` style photo in a directory (store only).
    /// Photos sharing a name are averaged into one sample.
    EncodeDir { dir: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enroll {
            id,
            name,
            program,
            branch,
            mobile,
            email,
            photo,
        } => {
            let student = Student {
                id,
                name,
                program,
                branch,
                mobile,
                email,
            };
            let image = read_photo(&photo)?;
            let proxy = connect().await?;
            let message = proxy
                .enroll_student(&serde_json::to_string(&student)?, &image)
                .await?;
            println!("{message}");
        }
        Commands::AddSample { name, photo } => {
            let image = read_photo(&photo)?;
            let message = connect().await?.add_sample(&name, &image).await?;
            println!("{message}");
        }
        Commands::Mark {
            images,
            lecture,
            section,
            out_dir,
            json,
        } => {
            let photos = images
                .iter()
                .map(|p| read_photo(p))
                .collect::<Result<Vec<_>>>()?;
            let (report, annotated) = connect()
                .await?
                .mark_attendance(&photos, &lecture, &section)
                .await?;

            if json {
                println!("{report}");
            } else {
                print_report(&serde_json::from_str(&report)?, &images);
            }
            if let Some(dir) = out_dir {
                let written = write_annotated(&dir, &images, &annotated)?;
                println!("{written} annotated image(s) written to {}", dir.display());
            }
        }
        Commands::Attendance { json } => {
            let rows = connect().await?.attendance_rows().await?;
            if json {
                println!("{rows}");
            } else {
                let rows: Vec<AttendanceRow> = serde_json::from_str(&rows)?;
                print_rows(&rows);
            }
        }
        Commands::Status => {
            let status = connect().await?.status().await?;
            let value: serde_json::Value = serde_json::from_str(&status)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::ReloadStore => {
            let load = connect().await?.reload_store().await?;
            println!("Embedding store {load}");
        }
        Commands::ImportRoster {
            csv,
            program,
            branch,
            db,
        } => {
            let db_path = db.unwrap_or_else(default_db_path);
            let db = AttendanceDb::open(&db_path)
                .with_context(|| format!("opening {}", db_path.display()))?;
            let file = std::fs::File::open(&csv)
                .with_context(|| format!("opening {}", csv.display()))?;
            let report = import_roster(&db, file, &ImportDefaults { program, branch })?;

            for (line, reason) in &report.skipped {
                eprintln!("line {line}: skipped ({reason})");
            }
            println!(
                "Imported {} student(s) into {} ({} skipped)",
                report.imported,
                db_path.display(),
                report.skipped.len()
            );
        }
        Commands::EncodeDir { dir } => {
            let proxy = connect().await?;
            let mut people = 0usize;
            let mut failed = 0usize;
            for (name, paths) in group_by_name(named_photos(&dir)?) {
                let mut sent = Vec::with_capacity(paths.len());
                let mut images = Vec::with_capacity(paths.len());
                for path in paths {
                    match std::fs::read(&path) {
                        Ok(bytes) => {
                            images.push(bytes);
                            sent.push(path);
                        }
                        Err(e) => {
                            failed += 1;
                            eprintln!("{}: {e}", path.display());
                        }
                    }
                }
                if images.is_empty() {
                    continue;
                }

                let outcome: serde_json::Value =
                    serde_json::from_str(&proxy.encode_faces(&name, &images).await?)?;
                for skip in outcome["skipped"].as_array().into_iter().flatten() {
                    failed += 1;
                    let index = skip[0].as_u64().unwrap_or(0) as usize;
                    let path = sent.get(index).map(|p| p.display().to_string()).unwrap_or_default();
                    eprintln!("{path}: {}", skip[1].as_str().unwrap_or("skipped"));
                }
                let samples = outcome["samples"].as_u64().unwrap_or(0);
                if samples > 0 {
                    people += 1;
                    println!("{name}: encoded from {samples} photo(s)");
                }
            }
            println!("Encoded {people} person(s), {failed} photo(s) failed");
        }
    }

    Ok(())
}

async fn connect() -> Result<AttendanceProxy<'static>> {
    let conn = zbus::connection::Builder::session()?
        .method_timeout(METHOD_TIMEOUT)
        .build()
        .await
        .context("connecting to the session bus")?;
    Ok(AttendanceProxy::new(&conn).await?)
}

fn read_photo(path: &Path) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if bytes.is_empty() {
        bail!("{} is empty", path.display());
    }
    Ok(bytes)
}

/// Same default as the daemon: `$ROLLCALL_DB_PATH`, else under the XDG data dir.
fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("ROLLCALL_DB_PATH") {
        return PathBuf::from(path);
    }
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall/rollcall.db")
}

/// Image files in `dir` paired with the identity name their filename encodes,
/// sorted by path. Files whose name yields no identity are skipped.
fn named_photos(dir: &Path) -> Result<Vec<(PathBuf, String)>> {
    let mut photos = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        match name_from_filename(&path) {
            Some(name) => photos.push((path, name)),
            None => tracing::debug!(path = %path.display(), "not a named photo, skipped"),
        }
    }
    photos.sort();
    Ok(photos)
}

/// Photos grouped by identity name, in name order.
fn group_by_name(photos: Vec<(PathBuf, String)>) -> BTreeMap<String, Vec<PathBuf>> {
    let mut groups: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for (path, name) in photos {
        groups.entry(name).or_default().push(path);
    }
    groups
}

fn annotated_path(dir: &Path, source: &Path, index: usize) -> PathBuf {
    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");
    dir.join(format!("{index:02}_{stem}_annotated.jpg"))
}

fn write_annotated(dir: &Path, sources: &[PathBuf], annotated: &[Vec<u8>]) -> Result<usize> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let mut written = 0;
    for (index, (source, jpeg)) in sources.iter().zip(annotated).enumerate() {
        if jpeg.is_empty() {
            continue;
        }
        let path = annotated_path(dir, source, index);
        std::fs::write(&path, jpeg).with_context(|| format!("writing {}", path.display()))?;
        written += 1;
    }
    Ok(written)
}

fn print_report(report: &serde_json::Value, sources: &[PathBuf]) {
    let empty = Vec::new();
    for image in report["images"].as_array().unwrap_or(&empty) {
        let index = image["index"].as_u64().unwrap_or(0) as usize;
        let label = sources
            .get(index)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| format!("image {index}"));
        if let Some(error) = image["error"].as_str() {
            println!("{label}: {error}");
            continue;
        }
        let faces = image["faces"].as_array().unwrap_or(&empty);
        println!("{label}: {} face(s)", faces.len());
        for face in faces {
            let detail = face["error"]
                .as_str()
                .map(|e| format!("  [{e}]"))
                .unwrap_or_default();
            println!(
                "  {:<24} {:<15} {:.3}{detail}",
                face["name"].as_str().unwrap_or("?"),
                face["status"].as_str().unwrap_or("?"),
                face["confidence"].as_f64().unwrap_or(0.0),
            );
        }
    }

    let marked = report["session_attendance"].as_array().unwrap_or(&empty);
    println!("{} student(s) marked this session", marked.len());
}

fn print_rows(rows: &[AttendanceRow]) {
    if rows.is_empty() {
        println!("No attendance recorded");
        return;
    }
    println!(
        "{:<12} {:<24} {:<15} {:<20} {:<12} {}",
        "ID", "NAME", "STATUS", "TIMESTAMP", "LECTURE", "SECTION"
    );
    for row in rows {
        println!(
            "{:<12} {:<24} {:<15} {:<20} {:<12} {}",
            row.id,
            row.name,
            row.status.as_str(),
            row.timestamp.format(rollcall_core::attendance::TIMESTAMP_FORMAT).to_string(),
            row.lecture,
            row.section
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_photos_skips_unnamed_files() {
        let dir = tempfile::tempdir().unwrap();
        for file in ["Jane_Doe-1.jpg", "Jane_Doe-2.JPG", "notes.txt", "-3.png", "Raj.png"] {
            std::fs::write(dir.path().join(file), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("sub.jpg")).unwrap();

        let names: Vec<String> = named_photos(dir.path())
            .unwrap()
            .into_iter()
            .map(|(_, name)| name)
            .collect();
        assert_eq!(names, vec!["Jane Doe", "Jane Doe", "Raj"]);
    }

    #[test]
    fn test_group_by_name_collects_every_photo_of_a_person() {
        let photos = vec![
            (PathBuf::from("d/Jane_Doe-1.jpg"), "Jane Doe".to_string()),
            (PathBuf::from("d/Jane_Doe-2.jpg"), "Jane Doe".to_string()),
            (PathBuf::from("d/Jane_Doe-3.jpg"), "Jane Doe".to_string()),
            (PathBuf::from("d/Amir.png"), "Amir".to_string()),
        ];

        let groups = group_by_name(photos);
        assert_eq!(groups.keys().collect::<Vec<_>>(), vec!["Amir", "Jane Doe"]);
        assert_eq!(groups["Jane Doe"].len(), 3);
        assert_eq!(groups["Amir"], vec![PathBuf::from("d/Amir.png")]);
    }

    #[test]
    fn test_write_annotated_skips_empty_slots() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let sources = vec![PathBuf::from("a/class1.png"), PathBuf::from("b/class2.png")];
        let written =
            write_annotated(&out, &sources, &[Vec::new(), vec![0xFF, 0xD8, 0xFF]]).unwrap();

        assert_eq!(written, 1);
        assert!(out.join("01_class2_annotated.jpg").exists());
        assert!(!out.join("00_class1_annotated.jpg").exists());
    }

    #[test]
    fn test_read_photo_rejects_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.jpg");
        std::fs::write(&path, b"").unwrap();
        assert!(read_photo(&path).is_err());
    }
}
