// Licensed under the Apache-2.0 license

//! Steps that produce component files before the container is packed:
//! dm-verity hash tables, FIT images, U-Boot environments, boot ROM images,
//! SPI encryption and plain concatenation.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::{debug, info, warn};

use crate::boot_image::{build_aicboot_image, build_aicimage};
use crate::component::FileResolver;
use crate::config::{
    ExtensionConfig, HashTableConfig, ImageConfig, ItbConfig, PreProcessConfig, SpiencConfig,
    UbootEnvConfig,
};
use crate::error::{ImageError, Result};
use crate::partition::partition_env_string;
use crate::{write_output, BuildOptions};

const DEFAULT_DATA_BLOCK_SIZE: u32 = 1024;
const DEFAULT_HASH_BLOCK_SIZE: u32 = 4096;

/// Runs the external programs used during pre-processing.
pub trait ToolRunner {
    /// Runs `program` with `args` and returns its standard output.
    fn run(&self, program: &str, args: &[String]) -> Result<String>;
}

/// Runs tools as child processes, preferring binaries found in `tool_dir`.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    pub tool_dir: Option<PathBuf>,
}

impl CommandRunner {
    pub fn new(tool_dir: Option<PathBuf>) -> Self {
        Self { tool_dir }
    }

    fn program_path(&self, program: &str) -> PathBuf {
        let name = format!("{}{}", program, std::env::consts::EXE_SUFFIX);
        self.tool_dir
            .as_ref()
            .map(|dir| dir.join(&name))
            .filter(|path| path.is_file())
            .unwrap_or_else(|| PathBuf::from(program))
    }
}

impl ToolRunner for CommandRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<String> {
        let mut cmd = Command::new(self.program_path(program));
        cmd.args(args).stderr(Stdio::inherit());
        debug!("Executing {:?}", &cmd);
        let output = cmd.output().map_err(|e| ImageError::Tool {
            tool: program.to_string(),
            reason: e.to_string(),
        })?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            return Err(ImageError::Tool {
                tool: program.to_string(),
                reason: format!("{} {}", output.status, stdout.trim()),
            });
        }
        Ok(stdout)
    }
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

/// Context shared by all pre-processing steps.
struct PreProcess<'a> {
    cfg: &'a ImageConfig,
    opts: &'a BuildOptions,
    runner: &'a dyn ToolRunner,
    data: FileResolver,
    keys: FileResolver,
}

/// Runs every configured pre-processing step in its fixed order.
pub fn run_pre_process(
    cfg: &ImageConfig,
    opts: &BuildOptions,
    runner: &dyn ToolRunner,
) -> Result<()> {
    let Some(pre) = &cfg.pre_process else {
        return Ok(());
    };
    let ctx = PreProcess {
        cfg,
        opts,
        runner,
        data: opts.data_files(),
        keys: opts.key_files(),
    };
    ctx.run(pre)
}

impl PreProcess<'_> {
    fn run(&self, pre: &PreProcessConfig) -> Result<()> {
        if self.opts.sign {
            for (name, table) in &pre.hash_table {
                self.hash_table(name, table)?;
            }
        }
        for (name, itb) in &pre.itb {
            self.itb(name, itb)?;
        }
        if !pre.uboot_env.is_empty() {
            let parts = partition_env_string(self.cfg)?;
            for (name, env) in &pre.uboot_env {
                self.uboot_env(name, env, &parts)?;
            }
        }
        for (name, boot) in &pre.aicboot {
            info!("Creating {} ...", name);
            let image = build_aicboot_image(boot, &self.keys)?;
            write_output(&self.output(name), &image)?;
        }
        for (name, boot) in &pre.aicimage {
            info!("Creating {} ...", name);
            let image = build_aicimage(boot, &self.keys)?;
            write_output(&self.output(name), &image)?;
        }
        for (name, spienc) in &pre.spienc {
            self.spienc(name, spienc)?;
        }
        for (name, list) in &pre.concatenate {
            self.concatenate(name, list)?;
        }
        Ok(())
    }

    fn output(&self, name: &str) -> PathBuf {
        self.opts.datadir.join(name)
    }

    fn tool(&self, program: &str, args: Vec<String>) -> Result<String> {
        self.runner.run(program, &args)
    }

    fn fdtput(&self, dtb: &Path, prop: &str, value: &str) -> Result<()> {
        self.tool(
            "fdtput",
            vec![
                path_arg(dtb),
                "/chosen".to_string(),
                prop.to_string(),
                value.to_string(),
                "-ts".to_string(),
            ],
        )?;
        Ok(())
    }

    /// dm-verity hash tree for a root filesystem, with the verity
    /// parameters written into the kernel device tree.
    fn hash_table(&self, name: &str, table: &HashTableConfig) -> Result<()> {
        let out = self.output(name);
        info!("Creating {} ...", out.display());
        let rootfs = self.data.require(&table.file)?;
        let dtb = self.data.require(&table.dtb)?;
        let data_block = match &table.datasize {
            Some(size) => size.as_u32()?,
            None => DEFAULT_DATA_BLOCK_SIZE,
        };
        let hash_block = match &table.hashsize {
            Some(size) => size.as_u32()?,
            None => DEFAULT_HASH_BLOCK_SIZE,
        };

        let report = self.tool(
            "veritysetup",
            vec![
                "format".to_string(),
                format!("--data-block-size={}", data_block),
                format!("--hash-block-size={}", hash_block),
                path_arg(&rootfs),
                path_arg(&out),
            ],
        )?;
        let verity = VerityReport::parse(&report);

        if let (Some(private_key), Some(cert)) = (&table.private_key, &table.cert) {
            let create = self.sign_root_hash(&verity, private_key, cert)?;
            self.fdtput(&dtb, "dm-mod.create", &create)?;
        }

        let mut file_parts = table.file.split('.');
        let root_part = file_parts.next().unwrap_or_default();
        let fs_type = file_parts.next().ok_or_else(|| {
            ImageError::config(format!("Cannot tell file system of {}", table.file))
        })?;
        let hash_part = name.split('.').nth(1).ok_or_else(|| {
            ImageError::config(format!("Cannot tell hash partition from {}", name))
        })?;

        let waitfor = format!(
            "dm-mod.waitfor=PARTLABEL={},PARTLABEL={}",
            root_part, hash_part
        );
        self.fdtput(&dtb, "dm-mod.waitfor", &waitfor)?;

        let mut args = Vec::new();
        if fs_type == "ext4" || fs_type == "ext2" {
            args.push("rootwait".to_string());
        }
        args.push(format!("rootfstype={}", fs_type));
        args.push("root=/dev/dm-0".to_string());
        args.push("dm_verity.require_signature=1".to_string());
        self.fdtput(&dtb, "args", &args.join(" "))?;
        self.fdtput(&dtb, "root_part", root_part)?;
        self.fdtput(&dtb, "hash_part", hash_part)?;
        Ok(())
    }

    /// Signs the verity root hash and returns the `dm-mod.create` argument.
    fn sign_root_hash(
        &self,
        verity: &VerityReport,
        private_key: &str,
        cert: &str,
    ) -> Result<String> {
        let private_key = self.data.require(private_key)?;
        let cert = self.data.require(cert)?;
        let hash_txt = self.output("roothash.txt");
        let hash_signed = self.output("roothash.txt.signed");
        write_output(&hash_txt, verity.get("Root hash")?.as_bytes())?;

        let args = [
            "smime", "-sign", "-nocerts", "-noattr", "-binary", "-in",
        ]
        .into_iter()
        .map(String::from)
        .chain([
            path_arg(&hash_txt),
            "-inkey".to_string(),
            path_arg(&private_key),
            "-signer".to_string(),
            path_arg(&cert),
            "-outform".to_string(),
            "der".to_string(),
            "-out".to_string(),
            path_arg(&hash_signed),
        ])
        .collect();
        self.tool("openssl", args)?;
        let signature = std::fs::read(&hash_signed).map_err(ImageError::file(&hash_signed))?;

        let data_blocks: u64 = verity.number("Data blocks")?;
        let data_block_size: u64 = verity.number("Data block size")?;
        Ok(format!(
            "dm-mod.create=\"dm-0,,,ro,0 {} verity 1 data_dev hash_dev {} {} {} {} {} {} {} 3 ignore_zero_blocks root_hash_sig_hex {}\"",
            data_blocks * data_block_size / 512,
            verity.get("Data block size")?,
            verity.get("Hash block size")?,
            verity.get("Data blocks")?,
            verity.get("Hash type")?,
            verity.get("Hash algorithm")?,
            verity.get("Root hash")?,
            verity.get("Salt")?,
            hex::encode(signature),
        ))
    }

    fn itb(&self, name: &str, itb: &ItbConfig) -> Result<()> {
        let out = self.output(name);
        info!("Creating {} ...", out.display());
        let its = self.data.require(&itb.its)?;
        let dtb = itb.dtb.as_deref().map(|dtb| self.data.require(dtb)).transpose()?;
        let key_dir = itb.keydir.as_deref().and_then(|dir| self.existing_dir(dir));

        let mut args = vec!["-f".to_string(), path_arg(&its)];
        if let (Some(key_dir), Some(dtb), true) = (&key_dir, &dtb, self.opts.sign) {
            args.extend([
                "-k".to_string(),
                path_arg(key_dir),
                "-K".to_string(),
                path_arg(dtb),
                "-r".to_string(),
            ]);
        }
        args.push(path_arg(&out));
        self.tool("mkimage", args)?;

        // SPL with its device tree appended.
        if let Some(bin) = &itb.bin {
            let dtb = dtb.ok_or_else(|| {
                ImageError::config(format!("itb {} needs a dtb to build {}", name, bin.dst))
            })?;
            let mut data = self.data.read(&bin.src)?;
            data.extend(std::fs::read(&dtb).map_err(ImageError::file(&dtb))?);
            let dst = self.data.resolve(&bin.dst).unwrap_or_else(|| self.output(&bin.dst));
            write_output(&dst, &data)?;
        }
        Ok(())
    }

    fn existing_dir(&self, dir: &str) -> Option<PathBuf> {
        let found = [self.opts.datadir.join(dir), PathBuf::from(dir)]
            .into_iter()
            .find(|path| path.exists());
        if found.is_none() {
            warn!("Key directory {} is not exist", dir);
        }
        found
    }

    fn uboot_env(&self, name: &str, env: &UbootEnvConfig, parts: &str) -> Result<()> {
        let out = self.output(name);
        info!("Creating {} ...", out.display());
        let text = self.data.read(&env.file)?;

        let mut tmp = tempfile::Builder::new()
            .suffix(".part.tmp")
            .tempfile_in(&self.opts.datadir)?;
        tmp.write_all(parts.as_bytes())?;
        tmp.write_all(&text)?;
        tmp.flush()?;

        let mut args = Vec::new();
        if env.redundant.as_deref().is_some_and(|r| r.contains("enable")) {
            args.push("-r".to_string());
        }
        args.extend([
            "-s".to_string(),
            env.size.to_string(),
            "-o".to_string(),
            path_arg(&out),
            path_arg(tmp.path()),
        ]);
        self.tool("mkenvimage", args)?;
        Ok(())
    }

    fn spienc(&self, name: &str, spienc: &SpiencConfig) -> Result<()> {
        let out = self.output(name);
        info!("Creating {} ...", out.display());
        let mut args = vec![
            "--key".to_string(),
            path_arg(&self.keys.require(&spienc.key)?),
        ];
        if let Some(nonce) = &spienc.nonce {
            args.push("--nonce".to_string());
            args.push(path_arg(&self.keys.require(nonce)?));
        }
        if let Some(tweak) = &spienc.tweak {
            args.push("--tweak".to_string());
            args.push(tweak.clone());
        }
        args.extend([
            "--addr".to_string(),
            spienc.address.clone(),
            "--input".to_string(),
            path_arg(&self.output(&spienc.file)),
            "--output".to_string(),
            path_arg(&out),
        ]);
        self.tool("spienc", args)?;
        Ok(())
    }

    fn concatenate(&self, name: &str, list: &serde_json::Value) -> Result<()> {
        let Some(files) = list.as_array() else {
            warn!("{} in 'concatenate' is not list", name);
            return Ok(());
        };
        let out = self.output(name);
        info!("Creating {} ...", out.display());
        let mut data = Vec::new();
        for file in files {
            let file = file.as_str().ok_or_else(|| {
                ImageError::config(format!("'concatenate' entry {} is not a file name", file))
            })?;
            data.extend(self.data.read(file)?);
        }
        write_output(&out, &data)
    }
}

/// Key/value lines printed by `veritysetup format`.
struct VerityReport(HashMap<String, String>);

impl VerityReport {
    fn parse(text: &str) -> Self {
        let fields = text
            .lines()
            .filter_map(|line| line.split_once(':'))
            .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
            .collect();
        Self(fields)
    }

    fn get(&self, key: &str) -> Result<&str> {
        self.0.get(key).map(String::as_str).ok_or_else(|| ImageError::Tool {
            tool: "veritysetup".to_string(),
            reason: format!("no '{}' in output", key),
        })
    }

    fn number(&self, key: &str) -> Result<u64> {
        let value = self.get(key)?;
        value.parse().map_err(|_| ImageError::Tool {
            tool: "veritysetup".to_string(),
            reason: format!("'{}' is not a number: {}", key, value),
        })
    }
}

/// Packs extension files and directories, relative to `datadir`, into a tar
/// archive at `out`.
pub fn make_extension_tar(datadir: &Path, ext: &ExtensionConfig, out: &Path) -> Result<()> {
    let file = File::create(out).map_err(ImageError::file(out))?;
    let mut tar = tar::Builder::new(file);
    for name in &ext.exfiles {
        let path = datadir.join(name);
        tar.append_path_with_name(&path, name)
            .map_err(ImageError::file(&path))?;
    }
    for name in &ext.exdirs {
        let path = datadir.join(name);
        tar.append_dir_all(name, &path)
            .map_err(ImageError::file(&path))?;
    }
    tar.into_inner()?.sync_all()?;
    info!("Packed extension {}", out.display());
    Ok(())
}
