#![cfg(test)]

use crate::module::{ModuleCodec, SmaliDirectoryCodec};
use crate::pipeline::{remove_permissions, RemovalConfig};
use crate::redirections::MarkerAnnotations;
use crate::smali_ops::DexOp;
use crate::types::{SmaliClass, SmaliOp};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const FINE_LOCATION: &str = "android.permission.ACCESS_FINE_LOCATION";

const TABLE: &str = "# API permissions
Landroid/location/LocationManager;->getLastKnownLocation(Ljava/lang/String;)Landroid/location/Location; android.permission.ACCESS_FINE_LOCATION,android.permission.ACCESS_COARSE_LOCATION
Landroid/location/LocationManager;->removeUpdates(Landroid/location/LocationListener;)V android.permission.ACCESS_FINE_LOCATION
Landroid/telephony/TelephonyManager;->getDeviceId()Ljava/lang/String; android.permission.READ_PHONE_STATE
";

const APP: &str = r#".class public Lcom/example/app/MainActivity;
.super Landroid/app/Activity;
.source "MainActivity.java"

# instance fields
.field private locationManager:Landroid/location/LocationManager;

.method public constructor <init>()V
    .locals 0

    invoke-direct {p0}, Landroid/app/Activity;-><init>()V

    return-void
.end method

.method protected onResume()V
    .locals 3

    .line 21
    iget-object v0, p0, Lcom/example/app/MainActivity;->locationManager:Landroid/location/LocationManager;

    const-string v1, "gps"

    invoke-virtual {v0, v1}, Landroid/location/LocationManager;->getLastKnownLocation(Ljava/lang/String;)Landroid/location/Location;

    move-result-object v2

    if-eqz v2, :cond_0

    .line 23
    invoke-virtual {v0, p0}, Landroid/location/LocationManager;->removeUpdates(Landroid/location/LocationListener;)V

    :cond_0
    return-void
.end method
"#;

const UTIL: &str = r#".class final Lcom/example/app/Util;
.super Ljava/lang/Object;

.method static deviceId(Landroid/telephony/TelephonyManager;)Ljava/lang/String;
    .locals 1

    invoke-virtual {p0}, Landroid/telephony/TelephonyManager;->getDeviceId()Ljava/lang/String;

    move-result-object v0

    return-object v0
.end method
"#;

const CUSTOM: &str = r#".class public Lcom/example/custom/Location;
.super Ljava/lang/Object;

.annotation runtime Lit/unige/dibris/rmperm/annotations/CustomMethodClass;
.end annotation

.method public static getLastKnownLocation(Landroid/location/LocationManager;Ljava/lang/String;)Landroid/location/Location;
    .locals 1
    .annotation runtime Lit/unige/dibris/rmperm/annotations/MethodPermission;
        defClass = "android.location.LocationManager"
        permission = "android.permission.ACCESS_FINE_LOCATION"
    .end annotation

    const/4 v0, 0x0

    return-object v0
.end method
"#;

const UNMARKED: &str = r#".class public Lcom/example/custom/Unmarked;
.super Ljava/lang/Object;
"#;

const DEBUG_CUSTOM: &str = r#".class public Lcom/example/custom/Location;
.super Ljava/lang/Object;
.source "Location.java"


# annotations
.annotation runtime Lit/unige/dibris/rmperm/annotations/CustomMethodClass;
.end annotation


# direct methods
.method public static getLastKnownLocation(Landroid/location/LocationManager;Ljava/lang/String;)Landroid/location/Location;
    .locals 1
    .param p0, "lm"    # Landroid/location/LocationManager;
    .param p1, "provider"    # Ljava/lang/String;
    .annotation runtime Lit/unige/dibris/rmperm/annotations/MethodPermission;
        defClass = "android.location.LocationManager"
        permission = "android.permission.ACCESS_FINE_LOCATION"
    .end annotation

    .line 14
    const/4 v0, 0x0

    return-object v0
.end method
"#;

const DEBUG_APP: &str = r#".class public Lcom/example/app/Sensors;
.super Ljava/lang/Object;
.source "Sensors.java"


# instance fields
.field private manager:Landroid/location/LocationManager;


# virtual methods
.method public start(Landroid/os/Vibrator;)V
    .locals 2
    .param p1, "vibrator"    # Landroid/os/Vibrator;
    .annotation system Ldalvik/annotation/Throws;
        value = {
            Ljava/io/IOException;
        }
    .end annotation

    .line 10
    const-wide/16 v0, 0x64

    invoke-virtual {p1, v0, v1}, Landroid/os/Vibrator;->vibrate(J)V

    .line 11
    return-void
.end method

.method public stop(Ljava/lang/String;)Landroid/location/Location;
    .locals 1
    .param p1    # Ljava/lang/String;
        .annotation build Landroidx/annotation/NonNull;
        .end annotation
    .end param

    .line 20
    iget-object v0, p0, Lcom/example/app/Sensors;->manager:Landroid/location/LocationManager;

    invoke-virtual {v0, p1}, Landroid/location/LocationManager;->getLastKnownLocation(Ljava/lang/String;)Landroid/location/Location;

    move-result-object v0

    return-object v0
.end method
"#;

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Workspace {
        let dir = TempDir::new().unwrap();
        let ws = Workspace { dir };
        ws.write("app/com/example/app/MainActivity.smali", APP);
        ws.write("app/com/example/app/Util.smali", UTIL);
        ws.write("custom/com/example/custom/Location.smali", CUSTOM);
        ws.write("custom/com/example/custom/Unmarked.smali", UNMARKED);
        ws.write("permissions.txt", TABLE);
        ws
    }

    fn path(&self, p: &str) -> std::path::PathBuf {
        self.dir.path().join(p)
    }

    fn write(&self, p: &str, contents: &str) {
        let path = self.path(p);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn config(&self, permissions: &[&str]) -> RemovalConfig {
        RemovalConfig {
            input: self.path("app"),
            output: self.path("out"),
            permission_table: self.path("permissions.txt"),
            custom_libraries: vec![self.path("custom")],
            permissions: permissions.iter().map(|p| p.to_string()).collect::<BTreeSet<_>>(),
            auto_remove_void: true,
            markers: MarkerAnnotations::default(),
        }
    }
}

fn invokes(class: &SmaliClass, method: &str) -> Vec<DexOp> {
    let method = class.methods.iter().find(|m| m.name == method).unwrap();
    method
        .ops
        .iter()
        .filter_map(|op| match op {
            SmaliOp::Op(o) if o.invoked_method().is_some() => Some(o.clone()),
            _ => None,
        })
        .collect()
}

fn read_class(path: &Path) -> SmaliClass {
    SmaliClass::read_from_file(path).unwrap()
}

#[test]
fn remove_location_permission() {
    let ws = Workspace::new();
    let report = remove_permissions(&ws.config(&[FINE_LOCATION]), &SmaliDirectoryCodec::default()).unwrap();

    assert_eq!(report.stats.redirected, 1);
    assert_eq!(report.stats.removed, 1);
    // getDeviceId is gated, returns a value and has no replacement
    assert_eq!(report.stats.unresolved, 1);
    assert_eq!(report.custom_classes, 1);
    assert_eq!(report.redirections, 1);
    assert_eq!(report.classes_written, 3);

    assert!(ws.path("out/com/example/custom/Location.smali").is_file());
    assert!(!ws.path("out/com/example/custom/Unmarked.smali").exists());

    let main = read_class(&ws.path("out/com/example/app/MainActivity.smali"));
    let calls = invokes(&main, "onResume");
    assert_eq!(calls.len(), 1);
    match &calls[0] {
        DexOp::InvokeStatic { registers, method } => {
            assert_eq!(registers.len(), 2);
            assert_eq!(method.class, "Lcom/example/custom/Location;");
            assert_eq!(method.signature.args.len(), 2);
        }
        other => panic!("unexpected call {other:?}"),
    }

    // Untouched classes are written back unchanged
    let util = read_class(&ws.path("out/com/example/app/Util.smali"));
    assert_eq!(util, SmaliClass::from_smali(UTIL).unwrap());
}

#[test]
fn unrequested_permission_keeps_calls() {
    let ws = Workspace::new();
    let mut config = ws.config(&["android.permission.CAMERA"]);
    config.auto_remove_void = false;
    let report = remove_permissions(&config, &SmaliDirectoryCodec::default()).unwrap();

    assert_eq!(report.stats.redirected, 0);
    assert_eq!(report.stats.removed, 0);
    assert_eq!(report.stats.unresolved, 3);
    assert_eq!(report.redirections, 0);
    // The marked class is shipped even though none of its methods is used
    assert_eq!(report.custom_classes, 1);

    let out = SmaliDirectoryCodec::default().parse(&ws.path("out")).unwrap();
    let main = out.find_class("Lcom/example/app/MainActivity;").unwrap();
    assert_eq!(main.as_ref(), &SmaliClass::from_smali(APP).unwrap());
}

#[test]
fn report_serializes() {
    let ws = Workspace::new();
    let report = remove_permissions(&ws.config(&[FINE_LOCATION]), &SmaliDirectoryCodec::default()).unwrap();
    let json: serde_json::Value = serde_json::to_value(&report).unwrap();
    assert_eq!(json["stats"]["redirected"], 1);
    assert_eq!(json["classes_written"], 3);
}

#[test]
fn clashing_class_names_abort_the_run() {
    let ws = Workspace::new();
    ws.write("app/com/example/custom/Location.smali", CUSTOM);
    let e = remove_permissions(&ws.config(&[FINE_LOCATION]), &SmaliDirectoryCodec::default()).unwrap_err();
    assert!(e.to_string().contains("Lcom/example/custom/Location;"), "{e}");
    assert!(!ws.path("out").exists());
}

#[test]
fn missing_table_is_fatal() {
    let ws = Workspace::new();
    fs::remove_file(ws.path("permissions.txt")).unwrap();
    assert!(remove_permissions(&ws.config(&[FINE_LOCATION]), &SmaliDirectoryCodec::default()).is_err());
}

#[test]
fn debug_named_parameters_in_library_and_application() {
    let ws = Workspace::new();
    ws.write("custom/com/example/custom/Location.smali", DEBUG_CUSTOM);
    ws.write("app/com/example/app/Sensors.smali", DEBUG_APP);
    ws.write("permissions.txt", &format!("{TABLE}Landroid/os/Vibrator;->vibrate(J)V android.permission.VIBRATE\n"));

    let report = remove_permissions(&ws.config(&[FINE_LOCATION]), &SmaliDirectoryCodec::default()).unwrap();
    assert_eq!(report.redirections, 1);
    assert_eq!(report.stats.redirected, 2);
    assert_eq!(report.stats.removed, 2);
    assert_eq!(report.stats.unresolved, 1);
    assert_eq!(report.classes_written, 4);

    let sensors = read_class(&ws.path("out/com/example/app/Sensors.smali"));
    assert_eq!(sensors.methods.len(), 2);
    assert!(invokes(&sensors, "start").is_empty());
    assert_eq!(sensors.methods[0].annotations.len(), 1);
    match invokes(&sensors, "stop").as_slice() {
        [DexOp::InvokeStatic { method, .. }] => assert_eq!(method.class, "Lcom/example/custom/Location;"),
        other => panic!("unexpected calls {other:?}"),
    }
}
