use std::{
    path::{Path, PathBuf},
    process::{Command, Output},
};

fn maildex_bin() -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Some(bin) = option_env!("CARGO_BIN_EXE_maildex") {
        return Ok(PathBuf::from(bin));
    }

    let mut path = std::env::current_exe()?;
    path.pop();
    if path.ends_with("deps") {
        path.pop();
    }
    path.push("maildex");

    if cfg!(windows) {
        path.set_extension("exe");
    }

    Ok(path)
}

fn run(data_dir: &Path, args: &[&str]) -> Result<Output, Box<dyn std::error::Error>> {
    Ok(Command::new(maildex_bin()?)
        .args(args)
        .env("MAILDEX_DATA_DIR", data_dir)
        .env("MAILDEX_LOG", "warn")
        .output()?)
}

fn setup_archive(dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let cur = dir.join("Work").join("cur");
    std::fs::create_dir_all(&cur)?;
    std::fs::write(
        cur.join("1700000000.1.host:2,S"),
        "Message-ID: <budget@example.com>\r\n\
         From: Alice <alice@example.com>\r\n\
         To: team@example.com\r\n\
         Subject: Q3 budget\r\n\
         Date: Tue, 14 Nov 2023 22:13:20 +0000\r\n\
         \r\n\
         The budget review moved to Thursday.\r\n",
    )?;
    std::fs::write(
        dir.join("lunch.eml"),
        "Message-ID: <lunch@example.com>\r\n\
         From: Bob <bob@example.com>\r\n\
         Subject: Lunch\r\n\
         \r\n\
         Pizza?\r\n",
    )?;
    Ok(())
}

#[test]
fn index_search_status_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
    let data = tempfile::tempdir()?;
    let archive = tempfile::tempdir()?;
    setup_archive(archive.path())?;
    let archive_arg = archive.path().to_string_lossy().to_string();

    let output = run(
        data.path(),
        &["--quiet", "index", "--content", "--archive", &archive_arg],
    )?;
    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8(output.stdout)?;
    assert!(stdout.contains("2 indexed"), "{stdout}");

    // The archive path is remembered for the next run.
    let output = run(data.path(), &["--quiet", "index", "--content"])?;
    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8(output.stdout)?;
    assert!(stdout.contains("0 indexed, 2 unchanged"), "{stdout}");

    let output = run(data.path(), &["search", "--json", "from:alice budget"])?;
    assert!(output.status.success(), "{output:?}");
    let json: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(json["result_count"], 1);
    assert_eq!(json["results"][0]["message_id"], "budget@example.com");
    assert_eq!(json["results"][0]["folder"], "Work");
    assert!(
        json["results"][0]["snippet"]
            .as_str()
            .is_some_and(|s| s.contains("**budget**"))
    );

    let output = run(data.path(), &["status", "--json", "--deep"])?;
    assert!(output.status.success(), "{output:?}");
    let json: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(json["documents"], 2);
    assert_eq!(json["healthy"], true);
    assert_eq!(json["check"], "integrity");
    assert_eq!(json["indexed"], true);
    assert_eq!(json["content_indexed"], true);

    // Leaving bodies out re-extracts every message without them.
    let output = run(data.path(), &["--quiet", "index"])?;
    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8(output.stdout)?;
    assert!(stdout.contains("2 indexed, 0 unchanged"), "{stdout}");

    let output = run(data.path(), &["status", "--json"])?;
    assert!(output.status.success(), "{output:?}");
    let json: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(json["content_indexed"], false);
    assert_eq!(json["check"], "connectivity");

    Ok(())
}

#[test]
fn status_before_first_index_creates_nothing() -> Result<(), Box<dyn std::error::Error>>
{
    let data = tempfile::tempdir()?;

    let output = run(data.path(), &["status", "--json"])?;
    assert!(output.status.success(), "{output:?}");
    let json: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(json["indexed"], false);
    assert_eq!(json["documents"], 0);
    assert!(!data.path().join("store").exists());

    let output = run(data.path(), &["status"])?;
    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8(output.stdout)?;
    assert!(stdout.contains("Not indexed yet"), "{stdout}");

    Ok(())
}

#[test]
fn invalid_query_fails() -> Result<(), Box<dyn std::error::Error>> {
    let data = tempfile::tempdir()?;

    // A leading negation is a query, not an option.
    let output = run(data.path(), &["search", "-draft"])?;
    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr)?;
    assert!(stderr.contains("InvalidQuery"), "{stderr}");

    Ok(())
}

#[test]
fn index_without_archive_is_a_config_error() -> Result<(), Box<dyn std::error::Error>>
{
    let data = tempfile::tempdir()?;

    let output = run(data.path(), &["index"])?;
    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr)?;
    assert!(stderr.contains("--archive"), "{stderr}");

    Ok(())
}

#[test]
fn rebuild_with_yes_reindexes() -> Result<(), Box<dyn std::error::Error>> {
    let data = tempfile::tempdir()?;
    let archive = tempfile::tempdir()?;
    setup_archive(archive.path())?;
    let archive_arg = archive.path().to_string_lossy().to_string();

    let output = run(data.path(), &["-q", "index", "-a", &archive_arg])?;
    assert!(output.status.success(), "{output:?}");

    let output = run(data.path(), &["-q", "rebuild", "--yes"])?;
    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8(output.stdout)?;
    assert!(stdout.contains("2 indexed"), "{stdout}");

    Ok(())
}
